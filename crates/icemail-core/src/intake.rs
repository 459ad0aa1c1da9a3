//! Intake pipeline: parse, decide, forward and archive inbound mail

use async_trait::async_trait;
use chrono::Utc;
use icemail_common::types::{format_date, MessageId};
use icemail_common::{Envelope, Error, MessageRecord, ParsedMessage, Result};
use icemail_storage::RecordStore;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::smtp::MessageHandler;
use crate::transport::Transport;
use crate::whitelist::Whitelist;

/// Accepts one inbound message at a time.
///
/// Whitelisted mail is forwarded before it is archived; if forwarding fails
/// the message is rejected and nothing is stored.
pub struct IntakePipeline {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    whitelist: Whitelist,
}

impl IntakePipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
        whitelist: Whitelist,
    ) -> Self {
        Self {
            store,
            transport,
            whitelist,
        }
    }

    /// Process one message and return the stored record
    pub async fn accept(&self, envelope: &Envelope, raw: &[u8]) -> Result<MessageRecord> {
        let parsed = ParsedMessage::parse(raw)?;

        let recipients = envelope.recipients();
        if recipients.is_empty() {
            return Err(Error::Validation(
                "Message envelope has no recipients".to_string(),
            ));
        }
        let sender = envelope.sender();

        // Decided on the To header, not the envelope
        let to: Vec<String> = parsed
            .to_addresses()
            .iter()
            .map(ToString::to_string)
            .collect();
        let delivered_at = if self.whitelist.matches(&to) {
            if let Err(e) = self.transport.send(&recipients, &sender, raw).await {
                warn!(
                    sender = %sender,
                    recipients = ?recipients,
                    "Whitelisted message rejected, forwarding failed: {}", e
                );
                return Err(e);
            }
            Some(Utc::now())
        } else {
            None
        };

        let mut header = parsed.header;
        if !header.contains("Date") {
            header.set("Date", format_date(Utc::now()));
        }

        let mut record = MessageRecord::new(header, raw.to_vec(), recipients);
        record.delivered_at = delivered_at;

        if let Err(e) = self.store.insert(&record).await {
            if record.is_delivered() {
                error!(id = %record.id, "Message forwarded but could not be archived: {}", e);
            }
            return Err(e);
        }

        info!(
            id = %record.id,
            recipients = ?record.recipients,
            sender = %sender,
            subject = record.subject().unwrap_or(""),
            origin = envelope.client_ip.as_deref().unwrap_or("-"),
            delivered = record.is_delivered(),
            "Message archived"
        );

        Ok(record)
    }
}

#[async_trait]
impl MessageHandler for IntakePipeline {
    async fn handle_message(&self, envelope: &Envelope, data: &[u8]) -> Result<MessageId> {
        self.accept(envelope, data).await.map(|record| record.id)
    }
}
