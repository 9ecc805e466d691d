//! The transport capability contract.

use async_trait::async_trait;
use pulse_core::PulseError;

/// A payload crossing a transport, in either direction.
///
/// Binary vs. text is orthogonal to the transport: both connectors
/// carry both, selected by the negotiated protocol version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text (sentinel frames or JSON-RPC).
    Text(String),
    /// Protobuf batch bytes.
    Binary(Vec<u8>),
}

/// Events a connector reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// The link is established.
    Connected,
    /// The link dropped remotely (close frame, transport error, or a
    /// failed poll cycle). Not emitted for an explicit local
    /// `disconnect`.
    Disconnected {
        /// Close code, or 1006 for abnormal loss.
        code: u16,
        /// Human-readable cause.
        reason: String,
    },
    /// Raw inbound payload, in transport-arrival order.
    Message(Payload),
}

/// Uniform contract over one physical transport.
///
/// Exactly one connector is active at a time; the orchestrator owns the
/// event channel and drives reconnection, so a connector never redials
/// on its own.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the link. Resolves once the transport is usable.
    async fn connect(&self) -> Result<(), PulseError>;

    /// Tear the link down. Idempotent; cancels every task the connector
    /// spawned so no callback outlives the teardown.
    async fn disconnect(&self, code: u16, reason: &str);

    /// Queue a payload for sending. Returns whether it was accepted
    /// (`false` when disconnected or the outbound queue is full).
    async fn send(&self, payload: Payload) -> bool;

    /// Whether the link is currently up.
    fn connected(&self) -> bool;
}
