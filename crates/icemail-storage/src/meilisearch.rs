//! Meilisearch-backed record store

use async_trait::async_trait;
use icemail_common::config::{MeilisearchConfig, SearchConfig};
use icemail_common::types::{canonical_name, MessageId, RECORD_TYPE};
use icemail_common::{Error, MessageRecord, Result};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::document::MessageDocument;
use crate::store::{RecordStore, SearchHits, StoreHit, StoreQuery, TextMatch, BODY_FIELD};

/// Interval between task status polls
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on hits Meilisearch will count and page through
const MAX_TOTAL_HITS: u64 = 1_000_000;

/// Search request parameters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchRequest {
    pub q: String,
    /// 1-based page number; page mode makes Meilisearch report `totalHits`
    pub page: u64,
    #[serde(rename = "hitsPerPage")]
    pub hits_per_page: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "attributesToSearchOn")]
    pub attributes_to_search_on: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    #[serde(rename = "showMatchesPosition")]
    pub show_matches_position: bool,
}

/// Search result from Meilisearch
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    pub hits: Vec<DocumentHit>,
    #[serde(rename = "processingTimeMs", default)]
    pub processing_time_ms: u64,
    /// Exact hit count, present in page mode
    #[serde(rename = "totalHits")]
    pub total_hits: Option<u64>,
}

/// A document hit with the positions of its matches
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentHit {
    #[serde(flatten)]
    pub document: MessageDocument,
    #[serde(rename = "_matchesPosition", default)]
    pub matches_position: HashMap<String, serde_json::Value>,
}

/// Task response from Meilisearch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    #[serde(rename = "taskUid")]
    pub task_uid: u64,
    pub status: String,
}

/// Task status as reported by `/tasks/{uid}`
#[derive(Debug, Clone, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Index settings for message search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    #[serde(rename = "searchableAttributes")]
    pub searchable_attributes: Vec<String>,
    #[serde(rename = "filterableAttributes")]
    pub filterable_attributes: Vec<String>,
    #[serde(rename = "sortableAttributes")]
    pub sortable_attributes: Vec<String>,
    #[serde(rename = "typoTolerance")]
    pub typo_tolerance: serde_json::Value,
    pub pagination: serde_json::Value,
}

/// Index statistics from `/indexes/{uid}/stats`
#[derive(Debug, Clone, Deserialize)]
pub struct IndexStats {
    /// Document count per (flattened) field name
    #[serde(rename = "fieldDistribution", default)]
    pub field_distribution: HashMap<String, u64>,
}

impl IndexSettings {
    /// Settings for the message index.
    ///
    /// Words shorter than `prefix_length + 1` never tolerate typos, and a
    /// second typo is only allowed when `fuzziness` is at least 2.
    pub fn for_search(search: &SearchConfig) -> Self {
        let one_typo = (search.prefix_length + 1).min(u8::MAX as usize);
        let two_typos = if search.fuzziness >= 2 {
            (search.prefix_length + 2).min(u8::MAX as usize)
        } else {
            u8::MAX as usize
        };

        Self {
            searchable_attributes: vec!["header".to_string(), "body".to_string()],
            filterable_attributes: vec!["type".to_string(), "date".to_string()],
            sortable_attributes: vec!["date".to_string(), "id".to_string()],
            typo_tolerance: serde_json::json!({
                "enabled": search.fuzziness > 0,
                "minWordSizeForTypos": {
                    "oneTypo": one_typo,
                    "twoTypos": two_typos,
                },
            }),
            pagination: serde_json::json!({ "maxTotalHits": MAX_TOTAL_HITS }),
        }
    }
}

/// Low-level Meilisearch HTTP client bound to one index
pub struct MeilisearchClient {
    config: MeilisearchConfig,
    client: Client,
}

impl MeilisearchClient {
    /// Create a new Meilisearch client
    pub fn new(config: MeilisearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Storage(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Build a request with optional auth header
    fn build_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), path);
        let request = self.client.request(method, &url);

        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn index_path(&self, suffix: &str) -> String {
        format!("/indexes/{}{}", self.config.index, suffix)
    }

    /// Turn a non-success response into a storage error
    async fn failure(response: reqwest::Response, what: &str) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!("{} failed: {} - {}", what, status, body);
        Error::Storage(format!("{} failed: {}", what, status))
    }

    /// Check if Meilisearch is healthy
    pub async fn health_check(&self) -> Result<()> {
        let response = self
            .build_request(Method::GET, "/health")
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Health check request failed: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            warn!("Meilisearch health check failed: status={}", response.status());
            Err(Self::failure(response, "Health check").await)
        }
    }

    /// Create the index if needed and apply its settings
    pub async fn setup_index(&self, settings: &IndexSettings) -> Result<()> {
        let create_body = serde_json::json!({
            "uid": self.config.index,
            "primaryKey": "id"
        });

        let response = self
            .build_request(Method::POST, "/indexes")
            .json(&create_body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to create index: {}", e)))?;

        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            let task: TaskResponse = response
                .json()
                .await
                .map_err(|e| Error::Storage(format!("Failed to parse task response: {}", e)))?;
            // Creating an existing index fails inside the task; that is fine here
            if let Err(e) = self.wait_for_task(task.task_uid).await {
                debug!("Index creation task did not succeed: {}", e);
            }
        } else {
            return Err(Self::failure(response, "Create index").await);
        }

        let response = self
            .build_request(Method::PATCH, &self.index_path("/settings"))
            .json(settings)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to update index settings: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, "Update index settings").await);
        }
        let task: TaskResponse = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("Failed to parse task response: {}", e)))?;
        self.wait_for_task(task.task_uid).await?;

        info!("Index {} ready", self.config.index);
        Ok(())
    }

    /// Add or replace documents, returning the indexing task
    pub async fn index_documents(&self, documents: &[MessageDocument]) -> Result<TaskResponse> {
        let response = self
            .build_request(Method::POST, &self.index_path("/documents"))
            .json(documents)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to index documents: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, "Index documents").await);
        }
        let task: TaskResponse = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("Failed to parse task response: {}", e)))?;
        debug!("Indexing task {} {}", task.task_uid, task.status);
        Ok(task)
    }

    /// Delete a document, returning the deletion task
    pub async fn delete_document(&self, document_id: &str) -> Result<TaskResponse> {
        let path = self.index_path(&format!("/documents/{}", document_id));
        let response = self
            .build_request(Method::DELETE, &path)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete document: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, "Delete document").await);
        }
        let task: TaskResponse = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("Failed to parse task response: {}", e)))?;
        debug!("Delete task {} {}", task.task_uid, task.status);
        Ok(task)
    }

    /// Fetch one document by id
    pub async fn get_document(&self, document_id: &str) -> Result<Option<MessageDocument>> {
        let path = self.index_path(&format!("/documents/{}", document_id));
        let response = self
            .build_request(Method::GET, &path)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to get document: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::failure(response, "Get document").await);
        }
        let document = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("Failed to parse document: {}", e)))?;
        Ok(Some(document))
    }

    /// Search for documents
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResult> {
        let response = self
            .build_request(Method::POST, &self.index_path("/search"))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Search failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, "Search").await);
        }
        let result: SearchResult = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("Failed to parse search response: {}", e)))?;
        debug!(
            "Search completed in {}ms, {} hits",
            result.processing_time_ms,
            result.hits.len()
        );
        Ok(result)
    }

    /// Fetch index statistics
    pub async fn stats(&self) -> Result<IndexStats> {
        let response = self
            .build_request(Method::GET, &self.index_path("/stats"))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to get index stats: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, "Get index stats").await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("Failed to parse index stats: {}", e)))
    }

    /// Poll a task until it finishes; a failed task is an error
    pub async fn wait_for_task(&self, task_uid: u64) -> Result<()> {
        let attempts = (self.config.timeout_secs * 1000 / TASK_POLL_INTERVAL.as_millis() as u64).max(1);

        for _ in 0..attempts {
            let response = self
                .build_request(Method::GET, &format!("/tasks/{}", task_uid))
                .send()
                .await
                .map_err(|e| Error::Storage(format!("Failed to get task: {}", e)))?;
            if !response.status().is_success() {
                return Err(Self::failure(response, "Get task").await);
            }
            let task: TaskStatus = response
                .json()
                .await
                .map_err(|e| Error::Storage(format!("Failed to parse task: {}", e)))?;

            match task.status.as_str() {
                "succeeded" => return Ok(()),
                "failed" | "canceled" => {
                    let reason = task
                        .error
                        .and_then(|e| e.get("message").and_then(|m| m.as_str()).map(String::from))
                        .unwrap_or_else(|| task.status.clone());
                    return Err(Error::Storage(format!("Task {} {}", task_uid, reason)));
                }
                _ => tokio::time::sleep(TASK_POLL_INTERVAL).await,
            }
        }

        Err(Error::Storage(format!("Timed out waiting for task {}", task_uid)))
    }
}

/// Record store backed by a Meilisearch index.
///
/// Writes wait for their indexing task so a completed insert is visible to
/// the next search.
pub struct MeilisearchStore {
    client: MeilisearchClient,
}

impl MeilisearchStore {
    pub fn new(client: MeilisearchClient) -> Self {
        Self { client }
    }

    /// Connect and prepare the index
    pub async fn connect(config: MeilisearchConfig, search: &SearchConfig) -> Result<Self> {
        let client = MeilisearchClient::new(config)?;
        client.setup_index(&IndexSettings::for_search(search)).await?;
        Ok(Self::new(client))
    }
}

/// Index attribute for a searchable field name
fn attribute_for(field: &str) -> String {
    let name = canonical_name(field);
    if name == BODY_FIELD {
        "body".to_string()
    } else {
        format!("header.{}", name)
    }
}

/// Field name for a `_matchesPosition` key such as `header.Subject.0`
fn location_for(key: &str) -> Option<String> {
    if key == "body" {
        return Some(BODY_FIELD.to_string());
    }
    let rest = key.strip_prefix("header.")?;
    let name = rest.split('.').next().unwrap_or(rest);
    Some(name.to_string())
}

/// Page number (1-based), page size and in-page skip whose page covers
/// `offset..offset + limit`.
///
/// Page mode has no free offset, so the page size grows from `limit` until
/// the requested window fits inside a single page.
fn page_window(offset: usize, limit: usize) -> (usize, usize, usize) {
    let limit = limit.max(1);
    let last = offset + limit - 1;
    let mut size = limit;
    loop {
        let page = offset / size;
        if last / size == page {
            return (page + 1, size, offset - page * size);
        }
        // Smallest size that puts `last` on page `page`
        size = last / (page + 1) + 1;
    }
}

fn build_search_request(query: &StoreQuery) -> SearchRequest {
    let q = match &query.text {
        TextMatch::All => String::new(),
        TextMatch::Phrase(phrase) => format!("\"{}\"", phrase.replace('"', "")),
        TextMatch::Fuzzy { term, .. } => term.clone(),
    };

    let mut filters = vec![format!("type = '{}'", RECORD_TYPE)];
    if let Some(range) = &query.date_range {
        if let Some(start) = range.start {
            // Dates are whole seconds; round a fractional start up
            let secs = start.timestamp() + i64::from(start.timestamp_subsec_nanos() > 0);
            filters.push(format!("date >= {}", secs));
        }
        if let Some(end) = range.end {
            filters.push(format!("date <= {}", end.timestamp()));
        }
    }

    let attributes = (!query.fields.is_empty() && query.text != TextMatch::All)
        .then(|| query.fields.iter().map(|f| attribute_for(f)).collect());

    let (page, hits_per_page, _) = page_window(query.offset, query.limit);

    SearchRequest {
        q,
        page: page as u64,
        hits_per_page: hits_per_page as u64,
        filter: Some(filters.join(" AND ")),
        attributes_to_search_on: attributes,
        sort: Some(vec!["date:desc".to_string(), "id:desc".to_string()]),
        show_matches_position: query.text != TextMatch::All,
    }
}

#[async_trait]
impl RecordStore for MeilisearchStore {
    async fn insert(&self, record: &MessageRecord) -> Result<()> {
        let document = MessageDocument::from_record(record);
        let task = self.client.index_documents(&[document]).await?;
        self.client.wait_for_task(task.task_uid).await
    }

    async fn delete(&self, id: MessageId) -> Result<()> {
        let task = self.client.delete_document(&id.to_string()).await?;
        self.client.wait_for_task(task.task_uid).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        self.client
            .get_document(&id.to_string())
            .await?
            .map(MessageDocument::into_record)
            .transpose()
    }

    async fn search(&self, query: &StoreQuery) -> Result<SearchHits> {
        let request = build_search_request(query);
        let result = self.client.search(&request).await?;

        let (_, _, skip) = page_window(query.offset, query.limit);

        let total = match result.total_hits {
            Some(total) => total,
            None => {
                warn!("Search response carried no totalHits");
                (query.offset + result.hits.len()) as u64
            }
        };
        let hits = result
            .hits
            .into_iter()
            .skip(skip)
            .take(query.limit)
            .map(|hit| {
                let mut locations: Vec<String> = hit
                    .matches_position
                    .keys()
                    .filter_map(|key| location_for(key))
                    .collect();
                locations.sort();
                locations.dedup();
                Ok(StoreHit {
                    record: hit.document.into_record()?,
                    locations,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SearchHits { total, hits })
    }

    async fn fields(&self) -> Result<Vec<String>> {
        let stats = self.client.stats().await?;
        let mut names: Vec<String> = stats
            .field_distribution
            .keys()
            .filter_map(|key| location_for(key))
            .collect();
        names.push(BODY_FIELD.to_string());
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn health_check(&self) -> Result<()> {
        self.client.health_check().await
    }
}
