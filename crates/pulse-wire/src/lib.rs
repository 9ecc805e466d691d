//! # pulse-wire
//!
//! The three wire formats the realtime protocol speaks:
//!
//! - **Text mode** ([`text`]): individual push messages framed with
//!   sentinel delimiters and concatenated in one long-poll body
//! - **JSON-RPC mode** ([`jsonrpc`]): `{jsonrpc:"2.0", ...}` frames for
//!   correlated calls, plus the bare `ping`/`pong` keepalive exchanged
//!   outside the envelope
//! - **Binary mode** ([`binary`]): the protobuf `RequestBatch` /
//!   `ResponseBatch` envelope used for direct publishing
//!
//! All modes carry the same opaque [`Envelope`] to subscribers.

#![deny(unsafe_code)]

pub mod binary;
pub mod envelope;
pub mod jsonrpc;
pub mod text;

pub use envelope::{Envelope, Extra};
