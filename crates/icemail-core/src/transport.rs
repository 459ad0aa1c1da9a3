//! Outbound transport

use async_trait::async_trait;
use icemail_common::config::{RelayConfig, RelaySecurity};
use icemail_common::{Error, Result};
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;
use tracing::debug;

/// Sends a complete message to a set of recipients
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `raw` verbatim. An empty `sender` is the null reverse path.
    async fn send(&self, recipients: &[String], sender: &str, raw: &[u8]) -> Result<()>;
}

/// Transport relaying through an upstream SMTP server
pub struct SmtpRelay {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    timeout: Duration,
}

impl SmtpRelay {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);

        let mut builder = match config.security {
            RelaySecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| Error::Config(format!("Invalid relay host: {}", e)))?,
            RelaySecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                    .map_err(|e| Error::Config(format!("Invalid relay host: {}", e)))?
            }
            RelaySecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        }
        .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let mailer = builder.timeout(Some(timeout)).build();
        Ok(Self { mailer, timeout })
    }
}

/// Build the SMTP envelope for a relay send
fn build_envelope(recipients: &[String], sender: &str) -> Result<Envelope> {
    let from = if sender.is_empty() {
        None
    } else {
        Some(
            sender
                .parse::<Address>()
                .map_err(|e| Error::Transport(format!("Invalid sender {}: {}", sender, e)))?,
        )
    };

    let to = recipients
        .iter()
        .map(|rcpt| {
            rcpt.parse::<Address>()
                .map_err(|e| Error::Transport(format!("Invalid recipient {}: {}", rcpt, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    Envelope::new(from, to).map_err(|e| Error::Transport(format!("Invalid envelope: {}", e)))
}

#[async_trait]
impl Transport for SmtpRelay {
    async fn send(&self, recipients: &[String], sender: &str, raw: &[u8]) -> Result<()> {
        let envelope = build_envelope(recipients, sender)?;

        match tokio::time::timeout(self.timeout, self.mailer.send_raw(&envelope, raw)).await {
            Ok(Ok(response)) => {
                debug!("Relay accepted message: {:?}", response.code());
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Transport(format!("Relay send failed: {}", e))),
            Err(_) => Err(Error::Transport(format!(
                "Relay send timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_envelope_with_null_sender() {
        let envelope = build_envelope(&["a@example.com".to_string()], "").unwrap();
        assert_eq!(envelope.from(), None);
        assert_eq!(envelope.to().len(), 1);
    }

    #[test]
    fn test_envelope_rejects_bad_addresses() {
        assert!(matches!(
            build_envelope(&["not an address".to_string()], "a@b.com"),
            Err(Error::Transport(_))
        ));
        assert!(matches!(
            build_envelope(&[], "a@b.com"),
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_transport_error() {
        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            timeout_secs: 2,
            ..Default::default()
        };
        let relay = SmtpRelay::new(&config).unwrap();
        let result = relay
            .send(&["a@example.com".to_string()], "b@example.com", b"Subject: x\r\n\r\nhi")
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_silent_relay_times_out() {
        // Accepts connections but never sends a greeting
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout_secs: 1,
            ..Default::default()
        };
        let relay = SmtpRelay::new(&config).unwrap();

        let started = std::time::Instant::now();
        let result = relay
            .send(&["a@example.com".to_string()], "b@example.com", b"Subject: x\r\n\r\nhi")
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(5));

        silent.abort();
    }
}
