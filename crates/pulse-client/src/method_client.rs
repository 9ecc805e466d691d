//! The consumed method-invocation client.
//!
//! The realtime layer never speaks the REST protocol itself; it fetches
//! channel config, resolves public ids, and renews watch tags through
//! this narrow contract, implemented by the host application's API
//! client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::PulseError;
use serde_json::Value;

/// Method used to fetch the realtime channel config.
pub const METHOD_CONFIG_GET: &str = "pull.config.get";
/// Method used to resolve public channel ids in batch.
pub const METHOD_PUBLIC_LIST: &str = "pull.channel.public.list";
/// Method used to renew active watch tags.
pub const METHOD_WATCH_EXTEND: &str = "pull.watch.extend";

/// A successful method invocation.
#[derive(Clone, Debug)]
pub struct MethodResponse {
    /// Result payload.
    pub result: Value,
    /// Server wall-clock time of the response, used to sample the
    /// client/server clock offset.
    pub server_time: Option<DateTime<Utc>>,
}

/// External method-invocation client (REST layer).
///
/// Authorization failures must surface as [`PulseError::Authorize`] so
/// the orchestrator can halt reconnection instead of retrying forever.
#[async_trait]
pub trait MethodClient: Send + Sync {
    /// Invoke a named server method.
    async fn call(&self, method: &str, params: Value) -> Result<MethodResponse, PulseError>;
}
