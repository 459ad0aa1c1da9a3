//! icemail Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy, the message record
//! model and raw message parsing shared across all icemail components.

pub mod config;
pub mod error;
pub mod message;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use message::ParsedMessage;
pub use types::{EmailAddress, Envelope, Header, MessageId, MessageRecord};
