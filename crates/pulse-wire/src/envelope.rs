//! The push-message envelope.
//!
//! Field names here are the wire names (snake_case on this protocol,
//! unlike the JSON-RPC layer).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One server-pushed message, opaque to the transport layer.
///
/// Wire format:
/// ```json
/// {
///   "mid": "16930358691397331849",
///   "tag": "b6...",
///   "time": "Fri, 29 Aug 2026 10:21:09 +0000",
///   "module_id": "im",
///   "command": "messageAdd",
///   "params": { ... },
///   "extra": { "revision": 19, "server_time_unix": 1756462869123.5 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque message id, used for dedup and resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    /// Server-side continuation tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Server wall-clock time of the event, as sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Logical module the message belongs to.
    pub module_id: String,
    /// Command within the module.
    pub command: String,
    /// Opaque business payload.
    #[serde(default)]
    pub params: Value,
    /// Protocol metadata attached by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Extra>,
}

/// Protocol metadata carried alongside a message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Extra {
    /// Server's current protocol revision; a nonzero value differing
    /// from the compiled one triggers the revision gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    /// Server unix time in milliseconds, used for clock-offset math.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time_unix: Option<f64>,
}

impl Envelope {
    /// Build a locally-originated envelope (no mid/tag/time).
    pub fn client(module_id: impl Into<String>, command: impl Into<String>, params: Value) -> Self {
        Self {
            mid: None,
            tag: None,
            time: None,
            module_id: module_id.into(),
            command: command.into(),
            params,
            extra: None,
        }
    }

    /// Server revision attached to this message, if any.
    #[must_use]
    pub fn server_revision(&self) -> Option<u32> {
        self.extra.as_ref().and_then(|e| e.revision)
    }
}
