//! Delivery activation of held messages

use chrono::Utc;
use icemail_common::types::MessageId;
use icemail_common::{EmailAddress, Error, MessageRecord, ParsedMessage, Result};
use icemail_storage::RecordStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::transport::Transport;

type LockTable = Mutex<HashMap<MessageId, Arc<tokio::sync::Mutex<()>>>>;

/// Forwards previously archived messages on demand.
///
/// Activations of the same id are serialised, so a message is sent at most
/// once even when two requests race. Each activation runs in its own task and
/// finishes even if the caller stops waiting for it.
#[derive(Clone)]
pub struct DeliveryActivator {
    inner: Arc<Activation>,
}

struct Activation {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    locks: Arc<LockTable>,
}

/// Per-id lock table entry, removed on drop once nobody else uses it
struct IdLock {
    table: Arc<LockTable>,
    id: MessageId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl IdLock {
    fn acquire(table: &Arc<LockTable>, id: MessageId) -> Result<Self> {
        let lock = table
            .lock()
            .map_err(|_| Error::Internal("Activation lock table poisoned".to_string()))?
            .entry(id)
            .or_default()
            .clone();
        Ok(Self {
            table: table.clone(),
            id,
            lock,
        })
    }
}

impl Drop for IdLock {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.table.lock() {
            // One reference in the table, one held here
            if Arc::strong_count(&self.lock) <= 2 {
                locks.remove(&self.id);
            }
        }
    }
}

impl DeliveryActivator {
    pub fn new(store: Arc<dyn RecordStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Activation {
                store,
                transport,
                locks: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Forward the message `id` and mark it delivered
    pub async fn activate(&self, id: MessageId) -> Result<MessageRecord> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let entry = IdLock::acquire(&inner.locks, id)?;
            let _guard = entry.lock.lock().await;
            inner.activate_locked(id).await
        })
        .await
        .map_err(|e| Error::Internal(format!("Activation of {} aborted: {}", id, e)))?
    }
}

impl Activation {
    async fn activate_locked(&self, id: MessageId) -> Result<MessageRecord> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Message {} not found", id)))?;

        if record.is_delivered() {
            return Err(Error::AlreadyDelivered(id.to_string()));
        }

        let parsed = ParsedMessage::parse(&record.raw_data)
            .map_err(|e| Error::Internal(format!("Stored message {} is corrupt: {}", id, e)))?;

        // Envelope recipients, never the To header
        if record.recipients.is_empty()
            || record
                .recipients
                .iter()
                .any(|rcpt| EmailAddress::parse(rcpt).is_none())
        {
            return Err(Error::NoRecipients(id.to_string()));
        }

        let sender = parsed
            .from_address()
            .map(|address| address.to_string())
            .unwrap_or_default();

        if let Err(e) = self
            .transport
            .send(&record.recipients, &sender, &record.raw_data)
            .await
        {
            warn!(id = %id, "Activation failed, message left undelivered: {}", e);
            return Err(e);
        }

        let delivered = record.delivered(Utc::now());
        self.replace(&delivered).await?;

        info!(
            id = %id,
            recipients = ?delivered.recipients,
            subject = delivered.subject().unwrap_or(""),
            "Message delivered on activation"
        );
        Ok(delivered)
    }

    /// Delete and reinsert under the same id, then confirm the new state.
    ///
    /// The store offers no transaction across the two calls; a failed
    /// reinsert after a successful delete loses the record.
    async fn replace(&self, delivered: &MessageRecord) -> Result<()> {
        let id = delivered.id;
        self.store.delete(id).await?;

        if let Err(e) = self.store.insert(delivered).await {
            error!(id = %id, "Record lost after delivery, reinsert failed: {}", e);
            return Err(e);
        }

        match self.store.get(id).await? {
            Some(stored) if stored.is_delivered() => Ok(()),
            _ => {
                error!(id = %id, "Delivered record missing after reinsert");
                Err(Error::Internal(format!(
                    "Message {} was sent but its delivery state was not recorded",
                    id
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;
    use icemail_common::types::Header;
    use async_trait::async_trait;
    use icemail_storage::{MemoryStore, SearchHits, StoreQuery};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    /// Memory store whose inserts take a while
    struct SlowInsertStore {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl RecordStore for SlowInsertStore {
        async fn insert(&self, record: &MessageRecord) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert(record).await
        }
        async fn delete(&self, id: MessageId) -> Result<()> {
            self.inner.delete(id).await
        }
        async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>> {
            self.inner.get(id).await
        }
        async fn search(&self, query: &StoreQuery) -> Result<SearchHits> {
            self.inner.search(query).await
        }
        async fn fields(&self) -> Result<Vec<String>> {
            self.inner.fields().await
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    const RAW: &[u8] = b"From: sender@example.org\r\n\
To: header@example.net\r\n\
Subject: held\r\n\
\r\n\
body\r\n";

    async fn held(store: &MemoryStore, raw: &[u8], recipients: &[&str]) -> MessageRecord {
        let header = ParsedMessage::parse(raw)
            .map(|p| p.header)
            .unwrap_or_else(|_| Header::new());
        let record = MessageRecord::new(
            header,
            raw.to_vec(),
            recipients.iter().map(|r| r.to_string()).collect(),
        );
        store.insert(&record).await.unwrap();
        record
    }

    fn activator(store: Arc<MemoryStore>, transport: Arc<RecordingTransport>) -> DeliveryActivator {
        DeliveryActivator::new(store, transport)
    }

    #[tokio::test]
    async fn test_activate_twice() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let record = held(&store, RAW, &["envelope@example.com"]).await;
        let activator = activator(store.clone(), transport.clone());

        let delivered = activator.activate(record.id).await.unwrap();
        assert!(delivered.is_delivered());
        assert_eq!(transport.calls(), 1);
        assert_eq!(transport.sent()[0].recipients, vec!["envelope@example.com".to_string()]);
        assert_eq!(transport.sent()[0].sender, "sender@example.org");

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.delivered_at, delivered.delivered_at);
        assert_eq!(stored.raw_data, record.raw_data);

        let second = activator.activate(record.id).await;
        assert!(matches!(second, Err(Error::AlreadyDelivered(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let activator = activator(store, transport.clone());

        let result = activator.activate(uuid::Uuid::now_v7()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::failing());
        let record = held(&store, RAW, &["envelope@example.com"]).await;
        let activator = activator(store.clone(), transport.clone());

        let result = activator.activate(record.id).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(store.get(record.id).await.unwrap(), Some(record.clone()));

        transport.set_failing(false);
        activator.activate(record.id).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_or_malformed_recipients() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let none = held(&store, RAW, &[]).await;
        let bad = held(&store, RAW, &["not-an-address"]).await;
        let activator = activator(store, transport.clone());

        assert!(matches!(
            activator.activate(none.id).await,
            Err(Error::NoRecipients(_))
        ));
        assert!(matches!(
            activator.activate(bad.id).await,
            Err(Error::NoRecipients(_))
        ));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_raw_data_is_internal_error() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let record = held(&store, b"no header here", &["a@example.com"]).await;
        let activator = activator(store, transport.clone());

        let err = activator.activate(record.id).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(err.status_code(), 500);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_activation_sends_once() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        transport.set_delay(Duration::from_millis(50));
        let record = held(&store, RAW, &["envelope@example.com"]).await;
        let activator = Arc::new(activator(store, transport.clone()));

        let first = tokio::spawn({
            let activator = activator.clone();
            async move { activator.activate(record.id).await }
        });
        let second = tokio::spawn({
            let activator = activator.clone();
            async move { activator.activate(record.id).await }
        });

        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::AlreadyDelivered(_)))));
        assert_eq!(transport.calls(), 1);
        assert!(activator.inner.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_activation_still_completes() {
        let memory = Arc::new(MemoryStore::new());
        let record = held(&memory, RAW, &["envelope@example.com"]).await;
        let store = Arc::new(SlowInsertStore {
            inner: memory.clone(),
            delay: Duration::from_millis(200),
        });
        let transport = Arc::new(RecordingTransport::new());
        let activator = DeliveryActivator::new(store, transport.clone());

        // Caller gives up while the record is between delete and reinsert
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), activator.activate(record.id)).await;
        assert!(abandoned.is_err());
        assert_eq!(transport.calls(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let stored = memory.get(record.id).await.unwrap().unwrap();
        assert!(stored.is_delivered());
        assert!(activator.inner.locks.lock().unwrap().is_empty());

        let again = activator.activate(record.id).await;
        assert!(matches!(again, Err(Error::AlreadyDelivered(_))));
        assert_eq!(transport.calls(), 1);
    }
}
