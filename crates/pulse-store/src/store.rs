//! The persistent key/value store contract.

use pulse_core::PulseError;
use tokio::sync::broadcast;

/// A single observed mutation of the store.
///
/// `origin` identifies the store handle that performed the write, so a
/// watcher can ignore its own mutations and react only to those made by
/// other instances sharing the same storage.
#[derive(Clone, Debug)]
pub struct StoreChange {
    /// Key that changed, relative to the store's namespace.
    pub key: String,
    /// New value, or `None` when the key was removed.
    pub value: Option<String>,
    /// Instance id of the writer.
    pub origin: u64,
}

/// Scoped key/value storage with change notifications.
///
/// The store is the only resource visible to multiple client instances
/// (browser tabs of one user, or processes sharing a file-backed map).
/// Writes are last-writer-wins and there is no read-after-write guarantee
/// across instances — only eventual observation through [`changes`].
///
/// [`changes`]: KeyValueStore::changes
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>, PulseError>;

    /// Write a value.
    fn set(&self, key: &str, value: &str) -> Result<(), PulseError>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), PulseError>;

    /// Subscribe to mutations of this store's namespace.
    ///
    /// Every `set`/`remove` by any instance sharing the storage is
    /// broadcast here, including this instance's own (filter on
    /// [`StoreChange::origin`] to skip those).
    fn changes(&self) -> broadcast::Receiver<StoreChange>;

    /// Identity of this store handle, echoed in [`StoreChange::origin`].
    fn instance_id(&self) -> u64;
}
