//! Indexed document representation of a message record

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use icemail_common::message::extract_body;
use icemail_common::types::Header;
use icemail_common::{Error, MessageRecord, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::BODY_FIELD;

/// Document structure for indexing messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDocument {
    /// Message ID (primary key)
    pub id: String,
    /// Record type discriminator
    #[serde(rename = "type")]
    pub record_type: String,
    /// Header fields, searchable
    pub header: Header,
    /// Decoded body text, searchable
    pub body: String,
    /// Raw message, base64 encoded, never searched
    pub raw_data: String,
    /// Envelope recipients
    pub recipients: Vec<String>,
    /// Delivery timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Effective date (Unix timestamp, for sorting and filtering)
    pub date: i64,
}

impl MessageDocument {
    /// Build the indexed form of a record
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            id: record.id.to_string(),
            record_type: record.record_type.clone(),
            header: record.header.clone(),
            body: extract_body(&record.raw_data),
            raw_data: STANDARD.encode(&record.raw_data),
            recipients: record.recipients.clone(),
            delivered_at: record.delivered_at,
            date: record.date().timestamp(),
        }
    }

    /// Convert back into a record
    pub fn into_record(self) -> Result<MessageRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| Error::Storage(format!("Invalid document id {}: {}", self.id, e)))?;
        let raw_data = STANDARD
            .decode(&self.raw_data)
            .map_err(|e| Error::Storage(format!("Corrupt raw data for {}: {}", self.id, e)))?;

        Ok(MessageRecord {
            id,
            record_type: self.record_type,
            header: self.header,
            raw_data,
            recipients: self.recipients,
            delivered_at: self.delivered_at,
        })
    }

    /// Searchable fields as (name, text) pairs: every header field plus the body
    pub fn searchable_fields(&self) -> Vec<(&str, String)> {
        let mut fields: Vec<(&str, String)> = self
            .header
            .iter()
            .map(|(name, values)| (name, values.join(" ")))
            .collect();
        fields.push((BODY_FIELD, self.body.clone()));
        fields
    }
}
