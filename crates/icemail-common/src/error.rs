//! Error types for icemail

use thiserror::Error;

/// Main error type for icemail
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed message bytes
    #[error("Parse error: {0}")]
    Parse(String),

    /// Record store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Outbound send failure, including timeouts
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Message {0} has already been delivered")]
    AlreadyDelivered(String),

    #[error("Message {0} has no recipients")]
    NoRecipients(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for icemail
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::AlreadyDelivered(_) => 400,
            Error::NoRecipients(_) => 400,
            Error::NotFound(_) => 404,
            Error::Config(_) => 500,
            Error::Parse(_) => 500,
            Error::Storage(_) => 500,
            Error::Transport(_) => 500,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Transport(_) => "SEND_FAILURE",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyDelivered(_) => "ALREADY_DELIVERED",
            Error::NoRecipients(_) => "NO_RECIPIENTS",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller is at fault rather than the server
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}
