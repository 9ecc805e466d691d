//! # pulse-core
//!
//! Foundation types shared by every pulse crate:
//!
//! - **Errors**: the [`PulseError`] taxonomy via `thiserror`
//! - **Status**: the [`ConnectionStatus`] state of the orchestrator
//! - **Backoff**: the attempt-based reconnect delay schedule
//! - **Constants**: compiled protocol revision and timing defaults

#![deny(unsafe_code)]

pub mod backoff;
pub mod constants;
pub mod errors;
pub mod status;

pub use backoff::{reconnect_delay_ms, reconnect_delay_with_jitter};
pub use constants::REVISION;
pub use errors::PulseError;
pub use status::ConnectionStatus;
