//! The storage contract and the in-memory reference store.
//!
//! The engine is written against [`EventStore`]; persistent backends live
//! outside this crate. Query results arrive over a channel so a backend can
//! stream from disk without buffering everything, and so the dispatcher can
//! stop consuming when a request is canceled.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use relay_proto::{Event, Filter};

/// Result of a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The event was already stored. Idempotent success, not a failure.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),
}

/// What a backend must provide.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn save(&self, event: &Event) -> Result<SaveOutcome, StorageError>;

    /// Stream every stored event matching the filter. The channel closes
    /// when the result set is exhausted.
    async fn query(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>, StorageError>;

    /// Count matching events. Only called when [`supports_count`] is true.
    ///
    /// [`supports_count`]: EventStore::supports_count
    async fn count(&self, filter: &Filter) -> Result<u64, StorageError>;

    async fn delete(&self, event_id: &str) -> Result<(), StorageError>;

    fn supports_count(&self) -> bool {
        false
    }
}

/// Reference store: a mutex-guarded map keyed by event id. Serves tests
/// and small relays; result ordering is newest first, as clients expect.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: Mutex<HashMap<String, Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, filter: &Filter) -> Vec<Event> {
        let events = self.events.lock().unwrap();
        let mut matched: Vec<Event> = events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            if limit >= 0 {
                matched.truncate(limit as usize);
            }
        }
        matched
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn save(&self, event: &Event) -> Result<SaveOutcome, StorageError> {
        let mut events = self.events.lock().unwrap();
        if events.contains_key(&event.id) {
            return Ok(SaveOutcome::Duplicate);
        }
        events.insert(event.id.clone(), event.clone());
        Ok(SaveOutcome::Saved)
    }

    async fn query(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>, StorageError> {
        let matched = self.matching(filter);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in matched {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn count(&self, filter: &Filter) -> Result<u64, StorageError> {
        Ok(self.matching(filter).len() as u64)
    }

    async fn delete(&self, event_id: &str) -> Result<(), StorageError> {
        self.events.lock().unwrap().remove(event_id);
        Ok(())
    }

    fn supports_count(&self) -> bool {
        true
    }
}
