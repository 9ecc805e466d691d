//! Cross-instance coordination flags.
//!
//! A client that gives up on a transport marks it blocked in the shared
//! store; every other instance of the same user observes the flip through
//! the change channel and re-evaluates its transport choice without
//! waiting for its own failure. Flags are stored as write timestamps with
//! a fixed TTL, so a stale marking self-heals even if nothing clears it.

use std::sync::Arc;
use std::time::Duration;

use pulse_core::constants::SHARED_FLAG_TTL_SECS;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::KeyValueStore;

/// Store key for the socket-transport-blocked flag.
pub const KEY_SOCKET_BLOCKED: &str = "blocked.socket";
/// Store key for the long-poll-blocked flag.
pub const KEY_LONG_POLL_BLOCKED: &str = "blocked.longPolling";
/// Store key for the logging-enabled flag.
pub const KEY_LOGGING_ENABLED: &str = "logging";

/// Transport flags that can be blocked across instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedFlag {
    /// The socket transport.
    Socket,
    /// The long-poll transport.
    LongPoll,
}

impl BlockedFlag {
    fn key(self) -> &'static str {
        match self {
            Self::Socket => KEY_SOCKET_BLOCKED,
            Self::LongPoll => KEY_LONG_POLL_BLOCKED,
        }
    }
}

/// Shared coordination config over a [`KeyValueStore`].
#[derive(Clone)]
pub struct CoordinationConfig {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl CoordinationConfig {
    /// Wrap a store with the default 24 h flag TTL.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(SHARED_FLAG_TTL_SECS),
        }
    }

    /// Wrap a store with a custom flag TTL.
    pub fn with_ttl(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Whether a transport is currently marked blocked.
    ///
    /// A flag counts as set only while its write timestamp is younger
    /// than the TTL; anything older (or unparseable) reads as unblocked.
    pub fn is_blocked(&self, flag: BlockedFlag) -> bool {
        self.timestamp_fresh(flag.key())
    }

    /// Mark or clear a transport as blocked.
    pub fn set_blocked(&self, flag: BlockedFlag, blocked: bool) {
        if blocked {
            let now = chrono::Utc::now().timestamp_millis();
            if let Err(err) = self.store.set(flag.key(), &now.to_string()) {
                debug!(flag = flag.key(), %err, "failed to persist blocked flag");
            }
        } else if let Err(err) = self.store.remove(flag.key()) {
            debug!(flag = flag.key(), %err, "failed to clear blocked flag");
        }
    }

    /// Whether verbose client logging was enabled by any instance.
    pub fn is_logging_enabled(&self) -> bool {
        self.timestamp_fresh(KEY_LOGGING_ENABLED)
    }

    /// Enable or disable verbose client logging for all instances.
    pub fn set_logging_enabled(&self, enabled: bool) {
        if enabled {
            let now = chrono::Utc::now().timestamp_millis();
            if let Err(err) = self.store.set(KEY_LOGGING_ENABLED, &now.to_string()) {
                debug!(%err, "failed to persist logging flag");
            }
        } else if let Err(err) = self.store.remove(KEY_LOGGING_ENABLED) {
            debug!(%err, "failed to clear logging flag");
        }
    }

    /// Watch for socket-blocked flips made by *other* instances.
    ///
    /// Spawns a task that invokes `on_flip(now_blocked)` whenever another
    /// instance sets or clears [`KEY_SOCKET_BLOCKED`]. Own writes are
    /// skipped. The task ends when `cancel` fires.
    pub fn spawn_socket_blocked_watch<F>(
        &self,
        on_flip: F,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut changes = self.store.changes();
        let own_id = self.store.instance_id();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => {
                        let Ok(change) = change else { break };
                        if change.origin == own_id || change.key != KEY_SOCKET_BLOCKED {
                            continue;
                        }
                        debug!(blocked = change.value.is_some(), "socket-blocked flag flipped elsewhere");
                        on_flip(change.value.is_some());
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    fn timestamp_fresh(&self, key: &str) -> bool {
        let Ok(Some(raw)) = self.store.get(key) else {
            return false;
        };
        let Ok(written_ms) = raw.parse::<i64>() else {
            return false;
        };
        let age_ms = chrono::Utc::now().timestamp_millis() - written_ms;
        #[allow(clippy::cast_possible_wrap)]
        let ttl_ms = self.ttl.as_millis() as i64;
        (0..ttl_ms).contains(&age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    fn config() -> (Arc<InMemoryStore>, CoordinationConfig) {
        let store = Arc::new(InMemoryStore::new("u1.s1"));
        let cfg = CoordinationConfig::new(Arc::clone(&store) as Arc<dyn KeyValueStore>);
        (store, cfg)
    }

    // ── flags ───────────────────────────────────────────────────────

    #[test]
    fn unset_flag_is_not_blocked() {
        let (_, cfg) = config();
        assert!(!cfg.is_blocked(BlockedFlag::Socket));
        assert!(!cfg.is_blocked(BlockedFlag::LongPoll));
    }

    #[test]
    fn set_blocked_then_read() {
        let (_, cfg) = config();
        cfg.set_blocked(BlockedFlag::Socket, true);
        assert!(cfg.is_blocked(BlockedFlag::Socket));
        assert!(!cfg.is_blocked(BlockedFlag::LongPoll));
    }

    #[test]
    fn clear_blocked() {
        let (_, cfg) = config();
        cfg.set_blocked(BlockedFlag::Socket, true);
        cfg.set_blocked(BlockedFlag::Socket, false);
        assert!(!cfg.is_blocked(BlockedFlag::Socket));
    }

    #[test]
    fn stale_flag_self_heals() {
        let (store, cfg) = config();
        // Write a timestamp a day and a bit in the past.
        let stale = chrono::Utc::now().timestamp_millis() - 25 * 60 * 60 * 1000;
        store.set(KEY_SOCKET_BLOCKED, &stale.to_string()).unwrap();
        assert!(!cfg.is_blocked(BlockedFlag::Socket));
    }

    #[test]
    fn garbage_flag_value_reads_unblocked() {
        let (store, cfg) = config();
        store.set(KEY_SOCKET_BLOCKED, "not-a-timestamp").unwrap();
        assert!(!cfg.is_blocked(BlockedFlag::Socket));
    }

    #[test]
    fn custom_ttl_expires_flag() {
        let store = Arc::new(InMemoryStore::new("u1.s1"));
        let cfg = CoordinationConfig::with_ttl(
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            Duration::from_millis(0),
        );
        cfg.set_blocked(BlockedFlag::Socket, true);
        assert!(!cfg.is_blocked(BlockedFlag::Socket));
    }

    // ── logging flag ────────────────────────────────────────────────

    #[test]
    fn logging_flag_roundtrip() {
        let (_, cfg) = config();
        assert!(!cfg.is_logging_enabled());
        cfg.set_logging_enabled(true);
        assert!(cfg.is_logging_enabled());
        cfg.set_logging_enabled(false);
        assert!(!cfg.is_logging_enabled());
    }

    // ── cross-instance watch ────────────────────────────────────────

    #[tokio::test]
    async fn watch_fires_on_foreign_flip() {
        let store_a = InMemoryStore::new("u1.s1");
        let store_b = store_a.clone();
        let cfg_a = CoordinationConfig::new(Arc::new(store_a));
        let cfg_b = CoordinationConfig::new(Arc::new(store_b));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = cfg_a.spawn_socket_blocked_watch(
            move |blocked| {
                let _ = tx.send(blocked);
            },
            cancel.clone(),
        );

        cfg_b.set_blocked(BlockedFlag::Socket, true);
        assert_eq!(rx.recv().await, Some(true));

        cfg_b.set_blocked(BlockedFlag::Socket, false);
        assert_eq!(rx.recv().await, Some(false));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn watch_ignores_own_writes() {
        let (_, cfg) = config();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<bool>();
        let cancel = CancellationToken::new();
        let _handle = cfg.spawn_socket_blocked_watch(
            move |blocked| {
                let _ = tx.send(blocked);
            },
            cancel.clone(),
        );

        cfg.set_blocked(BlockedFlag::Socket, true);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn watch_ignores_unrelated_keys() {
        let store_a = InMemoryStore::new("u1.s1");
        let store_b = store_a.clone();
        let cfg_a = CoordinationConfig::new(Arc::new(store_a));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<bool>();
        let cancel = CancellationToken::new();
        let _handle = cfg_a.spawn_socket_blocked_watch(
            move |blocked| {
                let _ = tx.send(blocked);
            },
            cancel.clone(),
        );

        store_b.set("something.else", "1").unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }
}
