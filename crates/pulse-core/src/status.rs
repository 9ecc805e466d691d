//! Connection status of the orchestrator.

use serde::{Deserialize, Serialize};

/// Single authoritative connection state, owned by the orchestrator.
///
/// Transitions emit a status event to subscribers; transitions to
/// `Offline` are delayed a few seconds to absorb flapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No transport is connected.
    #[default]
    Offline,
    /// A connect attempt is in flight.
    Connecting,
    /// A transport is connected and delivering messages.
    Online,
}

impl ConnectionStatus {
    /// Wire/diagnostic string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Online => "online",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_offline() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Offline);
    }

    #[test]
    fn as_str_values() {
        assert_eq!(ConnectionStatus::Offline.as_str(), "offline");
        assert_eq!(ConnectionStatus::Connecting.as_str(), "connecting");
        assert_eq!(ConnectionStatus::Online.as_str(), "online");
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Online).unwrap();
        assert_eq!(json, r#""online""#);
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
    }
}
