//! Shared handler state

use icemail_core::{DeliveryActivator, QueryBuilder};
use icemail_storage::RecordStore;
use std::sync::Arc;

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub queries: Arc<QueryBuilder>,
    pub activator: Arc<DeliveryActivator>,
}
