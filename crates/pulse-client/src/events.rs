//! Subscriptions and lifecycle events.
//!
//! Message subscriptions filter by module and optionally by command;
//! lifecycle events (status, revision mismatch, authorization failure)
//! go out on a separate broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use pulse_core::ConnectionStatus;
use pulse_wire::Envelope;
use tokio::sync::mpsc;
use tracing::trace;

/// Module carrying presence traffic, routed to its own subscriber kind.
pub const ONLINE_MODULE: &str = "online";

/// Which class of traffic a subscriber wants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubscriberKind {
    /// Server-originated messages (the default).
    #[default]
    Server,
    /// Client-originated messages relayed between instances.
    Client,
    /// Presence traffic.
    Online,
}

/// What a subscriber receives.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Module to match; `None` matches every module of the kind.
    pub module_id: Option<String>,
    /// Command to match; `None` matches every command.
    pub command: Option<String>,
    /// Traffic class.
    pub kind: SubscriberKind,
}

impl SubscriptionFilter {
    /// Filter on one module, all commands.
    #[must_use]
    pub fn module(module_id: impl Into<String>) -> Self {
        Self {
            module_id: Some(module_id.into()),
            command: None,
            kind: SubscriberKind::Server,
        }
    }

    /// Filter on one module and command.
    #[must_use]
    pub fn command(module_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            module_id: Some(module_id.into()),
            command: Some(command.into()),
            kind: SubscriberKind::Server,
        }
    }

    fn matches(&self, envelope: &Envelope, kind: SubscriberKind) -> bool {
        if self.kind != kind {
            return false;
        }
        if let Some(module_id) = &self.module_id {
            if module_id != &envelope.module_id {
                return false;
            }
        }
        if let Some(command) = &self.command {
            if command != &envelope.command {
                return false;
            }
        }
        true
    }
}

/// Out-of-band lifecycle notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection status changed.
    Status(ConnectionStatus),
    /// Server runs an incompatible protocol revision; the client has
    /// shut down and will not reconnect.
    RevisionMismatch {
        /// Revision the server announced.
        server: u32,
        /// Revision compiled into this client.
        client: u32,
    },
    /// Config fetch was rejected; reconnection is halted until the
    /// host refreshes credentials and restarts.
    AuthorizeError {
        /// HTTP status of the rejection.
        status: u16,
    },
}

struct Entry {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Registered message subscribers.
#[derive(Default)]
pub struct SubscriberTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Entry>>,
}

impl SubscriberTable {
    /// Register a subscriber; the subscription unregisters on drop.
    pub fn add(self: &Arc<Self>, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.entries.write().insert(id, Entry { filter, tx });
        Subscription {
            events: rx,
            _guard: SubscriptionGuard {
                id,
                table: Arc::clone(self),
            },
        }
    }

    /// Fan one admitted envelope out to every matching subscriber.
    /// Subscribers whose receiver is gone are pruned in passing.
    pub fn dispatch(&self, envelope: &Envelope, kind: SubscriberKind) {
        let mut dead = Vec::new();
        {
            let entries = self.entries.read();
            for (id, entry) in entries.iter() {
                if !entry.filter.matches(envelope, kind) {
                    continue;
                }
                if entry.tx.send(envelope.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut entries = self.entries.write();
            for id in dead {
                let _ = entries.remove(&id);
            }
        }
        trace!(module = %envelope.module_id, command = %envelope.command, "dispatched");
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no subscribers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn remove(&self, id: u64) {
        let _ = self.entries.write().remove(&id);
    }
}

struct SubscriptionGuard {
    id: u64,
    table: Arc<SubscriberTable>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// A live subscription; drop it to unsubscribe.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<Envelope>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    /// Receive the next matching envelope, or `None` once the client
    /// shuts down.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.events.try_recv().ok()
    }
}
