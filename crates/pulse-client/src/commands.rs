//! System commands: messages on the reserved module that steer the
//! connection itself and are never delivered to subscribers.

use pulse_wire::Envelope;
use serde_json::Value;
use tracing::warn;

use crate::config::ChannelDescriptor;

/// Reserved module id for protocol-level commands.
pub const SYSTEM_MODULE: &str = "pull";

/// A parsed system command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemCommand {
    /// The active channel grant expired server-side.
    ChannelExpired {
        /// Whether the server asked for an immediate reconnect.
        reconnect: bool,
        /// Replacement grant to hot-swap, when provided.
        replacement: Option<ChannelDescriptor>,
    },
    /// The whole config is stale and must be refetched.
    ConfigExpired,
    /// The server is restarting; back off before reconnecting.
    ServerRestart,
    /// A system command this client does not know.
    Unknown(String),
}

impl SystemCommand {
    /// Parse an envelope on the reserved module; `None` for any other
    /// module.
    #[must_use]
    pub fn parse(envelope: &Envelope) -> Option<Self> {
        if envelope.module_id != SYSTEM_MODULE {
            return None;
        }
        let parsed = match envelope.command.as_str() {
            "CHANNEL_EXPIRED" => Self::ChannelExpired {
                reconnect: envelope.params.get("action").and_then(Value::as_str)
                    == Some("reconnect"),
                replacement: envelope
                    .params
                    .get("new_channel")
                    .and_then(|value| match serde_json::from_value(value.clone()) {
                        Ok(channel) => Some(channel),
                        Err(err) => {
                            warn!(%err, "unusable replacement channel in CHANNEL_EXPIRED");
                            None
                        }
                    }),
            },
            "CONFIG_EXPIRED" => Self::ConfigExpired,
            "SERVER_RESTART" => Self::ServerRestart,
            other => Self::Unknown(other.to_string()),
        };
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_system_module_is_not_a_command() {
        let env = Envelope::client("im", "CHANNEL_EXPIRED", json!({}));
        assert!(SystemCommand::parse(&env).is_none());
    }

    #[test]
    fn channel_expired_with_replacement() {
        let env = Envelope::client(
            SYSTEM_MODULE,
            "CHANNEL_EXPIRED",
            json!({
                "action": "reconnect",
                "new_channel": {"id": "fresh1", "end": 1_790_000_000i64}
            }),
        );
        let cmd = SystemCommand::parse(&env).unwrap();
        assert_eq!(
            cmd,
            SystemCommand::ChannelExpired {
                reconnect: true,
                replacement: Some(ChannelDescriptor {
                    id: "fresh1".into(),
                    end: 1_790_000_000,
                }),
            }
        );
    }

    #[test]
    fn channel_expired_without_replacement() {
        let env = Envelope::client(SYSTEM_MODULE, "CHANNEL_EXPIRED", json!({}));
        let cmd = SystemCommand::parse(&env).unwrap();
        assert_eq!(
            cmd,
            SystemCommand::ChannelExpired {
                reconnect: false,
                replacement: None,
            }
        );
    }

    #[test]
    fn malformed_replacement_degrades_to_none() {
        let env = Envelope::client(
            SYSTEM_MODULE,
            "CHANNEL_EXPIRED",
            json!({"new_channel": {"id": 5}}),
        );
        let cmd = SystemCommand::parse(&env).unwrap();
        assert_eq!(
            cmd,
            SystemCommand::ChannelExpired {
                reconnect: false,
                replacement: None,
            }
        );
    }

    #[test]
    fn config_expired_and_server_restart() {
        let expired = Envelope::client(SYSTEM_MODULE, "CONFIG_EXPIRED", json!({}));
        assert_eq!(
            SystemCommand::parse(&expired),
            Some(SystemCommand::ConfigExpired)
        );
        let restart = Envelope::client(SYSTEM_MODULE, "SERVER_RESTART", json!({}));
        assert_eq!(
            SystemCommand::parse(&restart),
            Some(SystemCommand::ServerRestart)
        );
    }

    #[test]
    fn unknown_command_is_preserved() {
        let env = Envelope::client(SYSTEM_MODULE, "FUTURE_THING", json!({}));
        assert_eq!(
            SystemCommand::parse(&env),
            Some(SystemCommand::Unknown("FUTURE_THING".into()))
        );
    }
}
