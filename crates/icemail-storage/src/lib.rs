//! icemail Storage - Record store abstraction
//!
//! This crate defines the record store interface used by the intake,
//! delivery and query components, with an in-memory implementation and a
//! Meilisearch-backed implementation.

pub mod document;
pub mod memory;
pub mod meilisearch;
pub mod store;

pub use document::MessageDocument;
pub use memory::MemoryStore;
pub use meilisearch::{MeilisearchClient, MeilisearchStore};
pub use store::{DateRange, RecordStore, SearchHits, StoreHit, StoreQuery, TextMatch};
