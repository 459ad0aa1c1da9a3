//! Record store interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use icemail_common::types::MessageId;
use icemail_common::{MessageRecord, Result};

/// Searchable field holding the decoded body text
pub const BODY_FIELD: &str = "Body";

/// Text clause of a store query
#[derive(Debug, Clone, PartialEq)]
pub enum TextMatch {
    /// Every record matches
    All,
    /// Exact word sequence
    Phrase(String),
    /// Single term with bounded edit distance or prefix match
    Fuzzy {
        term: String,
        fuzziness: u8,
        prefix_length: usize,
    },
}

/// Inclusive date range over a record's effective date
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| date >= start) && self.end.map_or(true, |end| date <= end)
    }
}

/// A structured query against the record store.
///
/// Results are always ordered by effective date, most recent first.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreQuery {
    pub text: TextMatch,
    /// Restrict the text clause to these fields, OR'd together
    pub fields: Vec<String>,
    pub date_range: Option<DateRange>,
    pub limit: usize,
    pub offset: usize,
}

impl StoreQuery {
    /// Match-all query returning the first `limit` records
    pub fn all(limit: usize) -> Self {
        Self {
            text: TextMatch::All,
            fields: Vec::new(),
            date_range: None,
            limit,
            offset: 0,
        }
    }
}

/// One search hit
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHit {
    pub record: MessageRecord,
    /// Fields the text clause matched in
    pub locations: Vec<String>,
}

/// A page of search results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    /// Number of matching records across all pages
    pub total: u64,
    pub hits: Vec<StoreHit>,
}

/// Record store trait.
///
/// Each single operation is atomic; there are no transactions spanning
/// several operations.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record under its id
    async fn insert(&self, record: &MessageRecord) -> Result<()>;

    /// Delete a record by id
    async fn delete(&self, id: MessageId) -> Result<()>;

    /// Look up a record by exact id
    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>>;

    /// Run a structured query
    async fn search(&self, query: &StoreQuery) -> Result<SearchHits>;

    /// Names usable as search locations: header fields seen so far plus `Body`
    async fn fields(&self) -> Result<Vec<String>>;

    /// Check the store is reachable
    async fn health_check(&self) -> Result<()>;
}
