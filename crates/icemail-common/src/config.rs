//! Configuration for icemail

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inbound SMTP listener
    pub smtp: SmtpConfig,

    /// Outbound relay used for forwarding
    pub relay: RelayConfig,

    /// HTTP API configuration
    pub api: ApiConfig,

    /// Record store backend
    pub store: StoreConfig,

    /// Query constants
    pub search: SearchConfig,

    /// Addresses (`user@domain`) or bare domains forwarded immediately
    pub whitelist: Vec<String>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// SMTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Hostname for SMTP banner
    pub hostname: String,

    /// Bind host
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Maximum message size in bytes
    pub max_message_size: usize,

    /// Maximum recipients per message
    pub max_recipients: usize,

    /// Maximum concurrent connections
    pub max_connections: usize,

    /// Idle timeout per command line in seconds
    pub connection_timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            host: "127.0.0.1".to_string(),
            port: 2525,
            max_message_size: 25 * 1024 * 1024, // 25 MB
            max_recipients: 100,
            max_connections: 100,
            connection_timeout_secs: 300,
        }
    }
}

/// Connection security towards the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelaySecurity {
    /// Plain connection
    #[default]
    None,
    /// Upgrade with STARTTLS
    Starttls,
    /// Implicit TLS
    Tls,
}

/// Outbound relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub security: RelaySecurity,
    /// Upper bound for a whole send, in seconds
    pub timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25,
            username: None,
            password: None,
            security: RelaySecurity::None,
            timeout_secs: 30,
        }
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bind host
    pub host: String,

    /// API port
    pub port: u16,

    /// CORS allowed origins
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

/// Record store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Meilisearch,
}

/// Record store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Meilisearch settings, used when `backend = "meilisearch"`
    pub meilisearch: MeilisearchConfig,
}

/// Meilisearch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeilisearchConfig {
    /// Meilisearch server URL
    pub url: String,

    /// API key for authentication
    pub api_key: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Index name for messages
    pub index: String,
}

impl Default for MeilisearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7700".to_string(),
            api_key: None,
            timeout_secs: 30,
            index: "messages".to_string(),
        }
    }
}

/// Query builder constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Hard ceiling for the result limit
    pub max_limit: usize,

    /// Limit applied when the request has none
    pub default_limit: usize,

    /// Maximum edit distance for single-term queries
    pub fuzziness: u8,

    /// Minimum length of a single-term query, and exact prefix length
    pub prefix_length: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_limit: 100,
            default_limit: 50,
            fuzziness: 1,
            prefix_length: 3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with `ICEMAIL_*` environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(crate::Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        Self::build(Some(path))
    }

    /// Load configuration from an explicit path or the default locations.
    ///
    /// Falls back to built-in defaults (plus environment) when no file exists.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let paths = [
            PathBuf::from("./icemail.toml"),
            PathBuf::from("/etc/icemail/icemail.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Self::build(None)
    }

    fn build(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ICEMAIL")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("whitelist")
                .with_list_parse_key("api.cors_origins")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.search.max_limit == 0 {
            return Err(crate::Error::Config(
                "search.max_limit must be greater than zero".to_string(),
            ));
        }
        if self.search.default_limit == 0 || self.search.default_limit > self.search.max_limit {
            return Err(crate::Error::Config(format!(
                "search.default_limit must be between 1 and {}",
                self.search.max_limit
            )));
        }
        if self.relay.timeout_secs == 0 {
            return Err(crate::Error::Config(
                "relay.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.search.max_limit, 100);
        assert!(config.whitelist.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
whitelist = ["example.com", "x@y.com"]

[smtp]
hostname = "mail.example.com"
port = 2526

[relay]
host = "smtp.example.com"
port = 587
security = "starttls"
username = "gateway"

[store]
backend = "meilisearch"

[store.meilisearch]
url = "http://search:7700"

[search]
max_limit = 20
default_limit = 10
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smtp.hostname, "mail.example.com");
        assert_eq!(config.smtp.max_recipients, 100);
        assert_eq!(config.relay.security, RelaySecurity::Starttls);
        assert_eq!(config.relay.username.as_deref(), Some("gateway"));
        assert_eq!(config.store.backend, StoreBackend::Meilisearch);
        assert_eq!(config.store.meilisearch.url, "http://search:7700");
        assert_eq!(config.store.meilisearch.index, "messages");
        assert_eq!(config.whitelist, vec!["example.com", "x@y.com"]);
        assert_eq!(config.search.default_limit, 10);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "whitelist = [\"example.org\"]\n[api]\nport = 9090").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.whitelist, vec!["example.org"]);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file(Path::new("/nonexistent/icemail.toml")).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut config = Config::default();
        config.search.default_limit = 500;
        assert!(config.validate().is_err());
    }
}
