//! Test doubles for the outbound transport

use async_trait::async_trait;
use icemail_common::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::transport::Transport;

/// One recorded send
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub recipients: Vec<String>,
    pub sender: String,
    pub raw: Vec<u8>,
}

/// Transport that records every call and can be told to fail or stall
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose sends always fail
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every send
    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.delay.lock() {
            *guard = Some(delay);
        }
    }

    /// Number of send attempts, failed ones included
    pub fn calls(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, recipients: &[String], sender: &str, raw: &[u8]) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMessage {
                recipients: recipients.to_vec(),
                sender: sender.to_string(),
                raw: raw.to_vec(),
            });
        }

        let delay = self.delay.lock().ok().and_then(|guard| *guard);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Transport("relay refused the message".to_string()));
        }
        Ok(())
    }
}
