//! In-memory record store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use icemail_common::types::{canonical_name, MessageId};
use icemail_common::{Error, MessageRecord, Result};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use crate::document::MessageDocument;
use crate::store::{RecordStore, SearchHits, StoreHit, StoreQuery, TextMatch, BODY_FIELD};

/// Record store kept in process memory.
///
/// Documents are indexed on insert, so searches see header fields and the
/// decoded body the same way the Meilisearch store does.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<MessageId, MessageDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: &MessageRecord) -> Result<()> {
        let document = MessageDocument::from_record(record);
        let mut documents = self.documents.write().await;
        if documents.contains_key(&record.id) {
            return Err(Error::Storage(format!("Record {} already exists", record.id)));
        }
        documents.insert(record.id, document);
        debug!(id = %record.id, "Inserted record");
        Ok(())
    }

    async fn delete(&self, id: MessageId) -> Result<()> {
        if self.documents.write().await.remove(&id).is_some() {
            debug!(id = %id, "Deleted record");
        }
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        let documents = self.documents.read().await;
        documents
            .get(&id)
            .cloned()
            .map(MessageDocument::into_record)
            .transpose()
    }

    async fn search(&self, query: &StoreQuery) -> Result<SearchHits> {
        let documents = self.documents.read().await;
        let wanted: Vec<String> = query.fields.iter().map(|f| canonical_name(f)).collect();

        let mut matched: Vec<(&MessageDocument, Vec<String>)> = Vec::new();
        for document in documents.values() {
            if let Some(range) = &query.date_range {
                match DateTime::<Utc>::from_timestamp(document.date, 0) {
                    Some(date) if range.contains(date) => {}
                    _ => continue,
                }
            }

            if query.text == TextMatch::All {
                matched.push((document, Vec::new()));
                continue;
            }

            let locations: Vec<String> = document
                .searchable_fields()
                .into_iter()
                .filter(|(name, _)| wanted.is_empty() || wanted.iter().any(|w| w == name))
                .filter(|(_, text)| text_matches(&query.text, text))
                .map(|(name, _)| name.to_string())
                .collect();

            if !locations.is_empty() {
                matched.push((document, locations));
            }
        }

        matched.sort_by(|(a, _), (b, _)| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));

        let total = matched.len() as u64;
        let hits = matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(document, locations)| {
                Ok(StoreHit {
                    record: document.clone().into_record()?,
                    locations,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SearchHits { total, hits })
    }

    async fn fields(&self) -> Result<Vec<String>> {
        let documents = self.documents.read().await;
        let mut names: BTreeSet<String> = documents
            .values()
            .flat_map(|document| document.header.iter().map(|(name, _)| name.to_string()))
            .collect();
        names.insert(BODY_FIELD.to_string());
        Ok(names.into_iter().collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Lower-cased alphanumeric runs
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn text_matches(text_match: &TextMatch, text: &str) -> bool {
    match text_match {
        TextMatch::All => true,
        TextMatch::Phrase(phrase) => {
            let words = tokenize(phrase);
            if words.is_empty() {
                return false;
            }
            tokenize(text)
                .windows(words.len())
                .any(|window| window == words.as_slice())
        }
        TextMatch::Fuzzy {
            term,
            fuzziness,
            prefix_length,
        } => {
            let term: Vec<char> = term.to_lowercase().chars().collect();
            tokenize(text).iter().any(|token| {
                let token: Vec<char> = token.chars().collect();
                token.starts_with(&term)
                    || (shared_prefix(&token, &term) >= *prefix_length
                        && levenshtein(&token, &term) <= usize::from(*fuzziness))
            })
        }
    }
}

fn shared_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
