//! SMTP listener module

mod handler;
mod server;

use async_trait::async_trait;
use icemail_common::types::MessageId;
use icemail_common::{Envelope, Result};

pub use handler::SmtpHandler;
pub use server::SmtpServer;

/// Receives each message accepted by the SMTP listener.
///
/// The outcome decides the reply to DATA: success is `250`, a
/// [`icemail_common::Error::Parse`] is a permanent `554`, anything else a
/// transient `451`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, envelope: &Envelope, data: &[u8]) -> Result<MessageId>;
}
