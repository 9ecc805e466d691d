//! # pulse-transport
//!
//! One physical transport at a time, behind a uniform contract:
//!
//! - [`Connector`]: the capability trait (`connect` / `disconnect` /
//!   `send` / `connected`) the orchestrator depends on
//! - [`SocketConnector`]: persistent duplex WebSocket link
//! - [`LongPollConnector`]: one outstanding HTTP request at a time
//! - [`RpcCorrelator`]: request/response correlation over a connector
//!   speaking the JSON-RPC protocol, with per-call timeouts and inbound
//!   command dispatch
//!
//! Connectors report connected-state transitions and raw inbound
//! payloads upward through an event channel; they never interpret
//! message contents.

#![deny(unsafe_code)]

pub mod connector;
pub mod correlator;
pub mod longpoll;
pub mod socket;

pub use connector::{Connector, Payload, TransportEvent};
pub use correlator::{HandlerFn, RpcCorrelator};
pub use longpoll::LongPollConnector;
pub use socket::SocketConnector;
