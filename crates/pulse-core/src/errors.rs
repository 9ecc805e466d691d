//! Error taxonomy for the pulse realtime client.
//!
//! Each variant maps to one failure domain with its own recovery policy:
//!
//! - [`PulseError::Transport`] — retried via the backoff schedule, never fatal
//! - [`PulseError::Protocol`] — the offending frame is dropped, the link stays up
//! - [`PulseError::Authorize`] — reconnection halts until the host re-authenticates
//! - [`PulseError::RevisionMismatch`] — the client disables itself
//! - [`PulseError::Publish`] — returned synchronously to the caller, not retried

use thiserror::Error;

/// Top-level error type for the pulse client.
#[derive(Debug, Error)]
pub enum PulseError {
    /// Connect or send failure on a transport.
    #[error("transport error: {context}")]
    Transport {
        /// What was being attempted.
        context: String,
    },

    /// Malformed frame or unknown correlation id.
    #[error("protocol error: {context}")]
    Protocol {
        /// Description of the offending frame.
        context: String,
    },

    /// Config fetch rejected with 401/403.
    #[error("authorize error (status {status})")]
    Authorize {
        /// HTTP-style status code from the method client.
        status: u16,
    },

    /// Server protocol revision differs from the compiled one.
    #[error("revision mismatch: server {server}, client {client}")]
    RevisionMismatch {
        /// Revision advertised by the server.
        server: u32,
        /// Revision this client was compiled against.
        client: u32,
    },

    /// Publishing rejected (unsupported or disabled by server config).
    #[error("publish error: {reason}")]
    Publish {
        /// Why the publish was rejected.
        reason: String,
    },

    /// Persistent store read/write failure.
    #[error("store error: {context}")]
    Store {
        /// Operation and key involved.
        context: String,
    },

    /// Missing or unusable connection config.
    #[error("config error: {context}")]
    Config {
        /// What was wrong with the config.
        context: String,
    },

    /// A correlated call received no response in time.
    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout {
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
        /// What was being awaited.
        context: String,
    },
}

impl PulseError {
    /// Whether the orchestrator should keep retrying after this error.
    ///
    /// Transport and timeout failures are retryable through the backoff
    /// schedule; everything else needs host intervention or is per-call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Shorthand for a transport error.
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
        }
    }

    /// Shorthand for a protocol error.
    pub fn protocol(context: impl Into<String>) -> Self {
        Self::Protocol {
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn transport_is_retryable() {
        assert!(PulseError::transport("connect refused").is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let err = PulseError::Timeout {
            timeout_ms: 5000,
            context: "rpc call".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn authorize_is_not_retryable() {
        let err = PulseError::Authorize { status: 401 };
        assert!(!err.is_retryable());
    }

    #[test]
    fn revision_mismatch_is_not_retryable() {
        let err = PulseError::RevisionMismatch {
            server: 20,
            client: 19,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = PulseError::transport("dial tcp: refused");
        assert_eq!(err.to_string(), "transport error: dial tcp: refused");
    }

    #[test]
    fn display_revision_mismatch() {
        let err = PulseError::RevisionMismatch {
            server: 21,
            client: 19,
        };
        assert_eq!(err.to_string(), "revision mismatch: server 21, client 19");
    }

    #[test]
    fn shorthand_constructors() {
        assert_matches!(PulseError::transport("x"), PulseError::Transport { .. });
        assert_matches!(PulseError::protocol("x"), PulseError::Protocol { .. });
    }
}
