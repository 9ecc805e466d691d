//! # pulse-client
//!
//! The realtime client proper, assembled from the lower crates:
//!
//! - [`ConnectionOrchestrator`]: the single long-lived connection of one
//!   client instance, with config fetch and caching, transport choice
//!   and fallback, backoff reconnection, keepalive supervision, the
//!   revision gate, and message admission
//! - [`ConnectionConfig`]: the server-issued connection snapshot and its
//!   validity rules
//! - [`SessionState`]: dedup window and resume cursor
//! - [`ChannelResolver`]: batched public-id resolution for publishing
//! - [`MethodClient`]: the narrow contract to the host's REST layer
//!
//! A host embeds this by implementing [`MethodClient`] and a
//! [`KeyValueStore`](pulse_store::KeyValueStore), then driving the
//! orchestrator:
//!
//! ```ignore
//! let orchestrator = ConnectionOrchestrator::with_defaults(api, store);
//! let mut messages = orchestrator.subscribe(SubscriptionFilter::module("im"));
//! orchestrator.start(None).await?;
//! while let Some(envelope) = messages.recv().await {
//!     // ...
//! }
//! ```

#![deny(unsafe_code)]

pub mod commands;
pub mod config;
pub mod events;
pub mod method_client;
pub mod orchestrator;
pub mod resolver;
pub mod session;

pub use commands::SystemCommand;
pub use config::{
    CachedConfig, ChannelDescriptor, Channels, ConnectionConfig, ConnectionMode, TransportConfig,
};
pub use events::{ClientEvent, SubscriberKind, Subscription, SubscriptionFilter};
pub use method_client::{MethodClient, MethodResponse};
pub use orchestrator::{
    ConnectionOrchestrator, ConnectorFactory, DebugSnapshot, DefaultConnectorFactory,
    OrchestratorOptions, TransportHandle, TransportKind,
};
pub use pulse_core::{ConnectionStatus, PulseError};
pub use resolver::{ChannelResolver, PublicIdDescriptor};
pub use session::{SessionResume, SessionState};
