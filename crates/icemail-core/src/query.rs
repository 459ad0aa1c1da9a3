//! Query builder: client search and list requests against the record store

use chrono::{DateTime, Utc};
use icemail_common::config::SearchConfig;
use icemail_common::message::extract_body;
use icemail_common::types::{Header, MessageId};
use icemail_common::{Error, MessageRecord, Result};
use icemail_storage::{DateRange, RecordStore, StoreQuery, TextMatch};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Client search request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    /// Free text; empty means match everything
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Header fields (or `Body`) to restrict the text match to
    pub locations: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// One message in a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    pub id: MessageId,
    pub header: Header,
    /// Decoded body text, only for lookups by id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl EmailRecord {
    /// Entry for a result page
    pub fn summary(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            header: record.header,
            body: None,
            recipients: Some(record.recipients),
            delivered_at: record.delivered_at,
        }
    }

    /// Entry for a single-document lookup, body included
    pub fn full(record: MessageRecord) -> Self {
        let body = extract_body(&record.raw_data);
        Self {
            body: Some(body),
            ..Self::summary(record)
        }
    }
}

/// Response to search, list and get
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total: u64,
    pub offset: usize,
    pub emails: Vec<EmailRecord>,
}

/// Field names a client can pass as search locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldsResponse {
    pub fields: Vec<String>,
}

/// Translates client requests into store queries
pub struct QueryBuilder {
    store: Arc<dyn RecordStore>,
    config: SearchConfig,
}

impl QueryBuilder {
    pub fn new(store: Arc<dyn RecordStore>, config: SearchConfig) -> Self {
        Self { store, config }
    }

    /// Validate a request and build the store query for it
    pub fn build(&self, request: &SearchRequest) -> Result<StoreQuery> {
        let limit = match request.limit {
            None | Some(0) => self.config.default_limit,
            Some(limit) if limit > self.config.max_limit => {
                return Err(Error::Validation(format!(
                    "limit {} exceeds the maximum of {}",
                    limit, self.config.max_limit
                )));
            }
            Some(limit) => limit,
        };

        if let (Some(start), Some(end)) = (request.start_time, request.end_time) {
            if start > end {
                return Err(Error::Validation(
                    "startTime must not be after endTime".to_string(),
                ));
            }
        }

        let text = match request.query.as_deref().map(str::trim) {
            None | Some("") => TextMatch::All,
            Some(query) if query.contains(char::is_whitespace) => {
                TextMatch::Phrase(query.to_string())
            }
            Some(term) => {
                if term.chars().count() < self.config.prefix_length {
                    return Err(Error::Validation(format!(
                        "query must be at least {} characters",
                        self.config.prefix_length
                    )));
                }
                TextMatch::Fuzzy {
                    term: term.to_string(),
                    fuzziness: self.config.fuzziness,
                    prefix_length: self.config.prefix_length,
                }
            }
        };

        let date_range = (request.start_time.is_some() || request.end_time.is_some()).then(|| {
            DateRange {
                start: request.start_time,
                end: request.end_time,
            }
        });

        let fields = request
            .locations
            .iter()
            .map(|location| location.trim())
            .filter(|location| !location.is_empty())
            .map(String::from)
            .collect();

        Ok(StoreQuery {
            text,
            fields,
            date_range,
            limit,
            offset: request.offset.unwrap_or(0),
        })
    }

    /// Run a search request
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let query = self.build(request)?;
        debug!(?query, "Running search");

        let hits = self.store.search(&query).await?;
        Ok(SearchResponse {
            total: hits.total,
            offset: query.offset,
            emails: hits
                .hits
                .into_iter()
                .map(|hit| EmailRecord::summary(hit.record))
                .collect(),
        })
    }

    /// List all messages, most recent first
    pub async fn list(&self, limit: Option<usize>, offset: Option<usize>) -> Result<SearchResponse> {
        self.search(&SearchRequest {
            limit,
            offset,
            ..Default::default()
        })
        .await
    }

    /// List the searchable field names
    pub async fn fields(&self) -> Result<FieldsResponse> {
        Ok(FieldsResponse {
            fields: self.store.fields().await?,
        })
    }

    /// Fetch one message by id, with its body
    pub async fn get(&self, id: MessageId) -> Result<SearchResponse> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Message {} not found", id)))?;

        Ok(SearchResponse {
            total: 1,
            offset: 0,
            emails: vec![EmailRecord::full(record)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use icemail_storage::{MemoryStore, SearchHits};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Memory store that counts searches
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        searches: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for CountingStore {
        async fn insert(&self, record: &MessageRecord) -> Result<()> {
            self.inner.insert(record).await
        }
        async fn delete(&self, id: MessageId) -> Result<()> {
            self.inner.delete(id).await
        }
        async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>> {
            self.inner.get(id).await
        }
        async fn search(&self, query: &StoreQuery) -> Result<SearchHits> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.inner.search(query).await
        }
        async fn fields(&self) -> Result<Vec<String>> {
            self.inner.fields().await
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn message(day: u32, subject: &str) -> MessageRecord {
        let date = format!("{} Mar 2024 08:00:00 +0000", day);
        let raw = format!("Subject: {}\r\nDate: {}\r\nTo: a@example.com\r\n\r\nbody {}", subject, date, day);
        let mut header = Header::new();
        header.append("Subject", subject);
        header.append("Date", date);
        header.append("To", "a@example.com");
        MessageRecord::new(header, raw.into_bytes(), vec!["a@example.com".to_string()])
    }

    async fn builder_with(records: &[MessageRecord]) -> (QueryBuilder, Arc<CountingStore>) {
        let store = Arc::new(CountingStore::default());
        for record in records {
            store.insert(record).await.unwrap();
        }
        (QueryBuilder::new(store.clone(), SearchConfig::default()), store)
    }

    #[test]
    fn test_request_json_shape() {
        let request: SearchRequest = serde_json::from_value(serde_json::json!({
            "query": "hello world",
            "limit": 10,
            "locations": ["Subject"],
            "startTime": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(request.query.as_deref(), Some("hello world"));
        assert_eq!(request.locations, vec!["Subject".to_string()]);
        assert_eq!(
            request.start_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(request.end_time, None);
    }

    #[tokio::test]
    async fn test_build_query_kinds() {
        let (builder, _) = builder_with(&[]).await;

        let all = builder.build(&SearchRequest::default()).unwrap();
        assert_eq!(all.text, TextMatch::All);
        assert_eq!(all.limit, 50);

        let phrase = builder
            .build(&SearchRequest {
                query: Some(" quarterly report ".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(phrase.text, TextMatch::Phrase("quarterly report".to_string()));

        let fuzzy = builder
            .build(&SearchRequest {
                query: Some("invoice".to_string()),
                locations: vec!["Subject".to_string(), " ".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            fuzzy.text,
            TextMatch::Fuzzy {
                term: "invoice".to_string(),
                fuzziness: 1,
                prefix_length: 3
            }
        );
        assert_eq!(fuzzy.fields, vec!["Subject".to_string()]);
    }

    #[tokio::test]
    async fn test_validation_errors_skip_the_store() {
        let (builder, store) = builder_with(&[]).await;

        for request in [
            SearchRequest {
                query: Some("ab".to_string()),
                ..Default::default()
            },
            SearchRequest {
                limit: Some(101),
                ..Default::default()
            },
            SearchRequest {
                start_time: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
                end_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                ..Default::default()
            },
        ] {
            let err = builder.search(&request).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
            assert_eq!(err.status_code(), 400);
        }
        assert_eq!(store.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pagination_is_stable() {
        let records: Vec<_> = (1..=5).map(|day| message(day, &format!("day {}", day))).collect();
        let (builder, _) = builder_with(&records).await;

        let first = builder.list(Some(2), Some(0)).await.unwrap();
        let second = builder.list(Some(2), Some(2)).await.unwrap();
        let third = builder.list(Some(2), Some(4)).await.unwrap();

        assert_eq!(first.total, 5);
        assert_eq!(second.total, 5);
        assert_eq!(second.offset, 2);

        let ids: Vec<_> = [first, second, third]
            .into_iter()
            .flat_map(|page| page.emails)
            .map(|email| email.id)
            .collect();
        let expected: Vec<_> = records.iter().rev().map(|r| r.id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_location_filter_keeps_total_accurate() {
        let mut records: Vec<_> = (1..=4).map(|day| message(day, "weekly sync")).collect();
        records.push(message(5, "unrelated"));
        let (builder, _) = builder_with(&records).await;

        let response = builder
            .search(&SearchRequest {
                query: Some("weekly".to_string()),
                locations: vec!["subject".to_string()],
                limit: Some(3),
                offset: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.total, 4);
        assert_eq!(response.emails.len(), 1);
        assert_eq!(response.emails[0].id, records[0].id);
    }

    #[tokio::test]
    async fn test_text_and_time_range_must_both_match() {
        let records = vec![
            message(1, "budget draft"),
            message(10, "budget final"),
            message(20, "budget review"),
            message(12, "holiday rota"),
        ];
        let (builder, _) = builder_with(&records).await;

        let response = builder
            .search(&SearchRequest {
                query: Some("budget".to_string()),
                start_time: Some(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()),
                end_time: Some(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.emails[0].id, records[1].id);
    }

    #[tokio::test]
    async fn test_fields_come_from_the_store() {
        let (builder, _) = builder_with(&[message(1, "hello")]).await;
        let response = builder.fields().await.unwrap();
        assert_eq!(response.fields, vec!["Body", "Date", "Subject", "To"]);
    }

    #[tokio::test]
    async fn test_get_includes_decoded_body() {
        let raw = b"Subject: menu\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
caf=C3=A9 today".to_vec();
        let mut header = Header::new();
        header.append("Subject", "menu");
        let record = MessageRecord::new(header, raw, vec!["a@example.com".to_string()]);
        let (builder, _) = builder_with(&[record.clone()]).await;

        let response = builder.get(record.id).await.unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.emails[0].body.as_deref(), Some("caf\u{e9} today"));

        let listed = builder.list(None, None).await.unwrap();
        assert_eq!(listed.emails[0].body, None);
    }

    #[tokio::test]
    async fn test_get_unknown_id() {
        let (builder, _) = builder_with(&[]).await;
        assert!(matches!(
            builder.get(uuid::Uuid::now_v7()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_email_record_serialization() {
        let mut header = Header::new();
        header.append("Subject", "hi");
        let record = MessageRecord::new(header, b"Subject: hi\r\n\r\nyo".to_vec(), vec!["a@b.com".into()])
            .delivered(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let json = serde_json::to_value(EmailRecord::summary(record)).unwrap();
        assert_eq!(json["header"]["Subject"][0], "hi");
        assert_eq!(json["deliveredAt"], "2024-01-01T00:00:00Z");
        assert!(json.get("body").is_none());
    }
}
