//! In-memory store implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use pulse_core::PulseError;
use tokio::sync::broadcast;

use crate::store::{KeyValueStore, StoreChange};

/// Capacity of the change-notification channel. Laggy receivers drop
/// old notifications rather than blocking writers.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

struct SharedState {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
}

/// Process-local key/value store.
///
/// Cloning yields a second handle over the same backing map with its own
/// instance id, which models two client instances sharing storage: a
/// write through one handle is observed by the other through the change
/// channel.
pub struct InMemoryStore {
    namespace: String,
    instance_id: u64,
    shared: Arc<SharedState>,
}

impl InMemoryStore {
    /// Create an empty store scoped to `namespace` (typically
    /// `"{user_id}.{site_id}"`).
    pub fn new(namespace: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            namespace: namespace.into(),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(SharedState {
                entries: RwLock::new(HashMap::new()),
                changes,
            }),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}.{key}", self.namespace)
    }

    fn notify(&self, key: &str, value: Option<String>) {
        // No receivers is fine; single-instance deployments never listen.
        let _ = self.shared.changes.send(StoreChange {
            key: key.to_string(),
            value,
            origin: self.instance_id,
        });
    }
}

impl Clone for InMemoryStore {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PulseError> {
        Ok(self.shared.entries.read().get(&self.scoped(key)).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PulseError> {
        let _ = self
            .shared
            .entries
            .write()
            .insert(self.scoped(key), value.to_string());
        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PulseError> {
        let removed = self.shared.entries.write().remove(&self.scoped(key));
        if removed.is_some() {
            self.notify(key, None);
        }
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.shared.changes.subscribe()
    }

    fn instance_id(&self) -> u64 {
        self.instance_id
    }
}
