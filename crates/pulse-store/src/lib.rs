//! # pulse-store
//!
//! Persistence and cross-instance coordination for the pulse client:
//!
//! - [`KeyValueStore`]: scoped get/set/remove plus a change-notification
//!   channel, the only resource shared between client instances
//! - [`InMemoryStore`]: process-local implementation; clones share one
//!   backing map, modelling multiple instances over the same storage
//! - [`CoordinationConfig`]: transport-blocked and logging flags with a
//!   fixed TTL, plus a watch task that reacts to flips made elsewhere
//!
//! Writers must treat the store as last-writer-wins; cross-instance
//! visibility is only "eventually, via change notification".

#![deny(unsafe_code)]

pub mod memory;
pub mod shared;
pub mod store;

pub use memory::InMemoryStore;
pub use shared::{BlockedFlag, CoordinationConfig};
pub use store::{KeyValueStore, StoreChange};
