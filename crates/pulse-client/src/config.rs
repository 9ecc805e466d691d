//! Connection config: the server-issued snapshot that tells a client
//! where to connect and which channels it may listen on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pulse_core::{PulseError, REVISION};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::session::SessionResume;

/// Protocol version from which the socket speaks JSON-RPC.
pub const MIN_JSON_RPC_PROTOCOL: u32 = 3;

/// Protocol version from which payloads use the binary batch format.
pub const MIN_BINARY_PROTOCOL: u32 = 2;

/// A signed, time-boxed subscription grant for one logical channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    /// Channel id (carries the server-side signature).
    pub id: String,
    /// Unix seconds after which the grant is dead.
    pub end: i64,
}

impl ChannelDescriptor {
    /// Whether the grant has passed its end time.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.end
    }
}

/// The private/shared channel pair of one config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channels {
    /// Per-user channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<ChannelDescriptor>,
    /// Site-wide shared channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<ChannelDescriptor>,
}

/// Whether the server multiplexes many users on one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// One channel per user.
    #[default]
    Personal,
    /// Shared channel, client identified by `client_id`.
    Shared,
}

/// Transport endpoints and capabilities advertised by the server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// Plain websocket endpoint.
    #[serde(default)]
    pub socket_url: String,
    /// TLS websocket endpoint.
    #[serde(default)]
    pub socket_url_secure: String,
    /// Plain long-poll endpoint.
    #[serde(default)]
    pub long_poll_url: String,
    /// TLS long-poll endpoint.
    #[serde(default)]
    pub long_poll_url_secure: String,
    /// Plain publish endpoint.
    #[serde(default)]
    pub publish_url: String,
    /// TLS publish endpoint.
    #[serde(default)]
    pub publish_url_secure: String,
    /// Whether the server accepts websocket connections at all.
    #[serde(default)]
    pub socket_enabled: bool,
    /// Whether direct publishing is enabled.
    #[serde(default)]
    pub publish_enabled: bool,
    /// Channel multiplexing mode.
    #[serde(default)]
    pub mode: ConnectionMode,
    /// Negotiated wire-protocol version (selects text/binary/JSON-RPC).
    #[serde(default)]
    pub protocol_version: u32,
    /// Client id on the shared channel (shared mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Immutable server-issued connection snapshot.
///
/// Replaced wholesale on refresh and never mutated in place, except for
/// the channel hot-swap performed by the channel-expired system command.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Server API revision the config was issued for.
    #[serde(default)]
    pub api_revision: u32,
    /// Subscription grants.
    #[serde(default)]
    pub channels: Channels,
    /// Known public channels keyed by id.
    #[serde(default)]
    pub public_channels: HashMap<String, ChannelDescriptor>,
    /// Endpoints and capabilities.
    pub transport: TransportConfig,
    /// Token-based connect credential, mutually exclusive with channel
    /// ids on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    /// Server-side issue timestamp, pinned locally to detect staleness.
    #[serde(default)]
    pub config_timestamp: i64,
    /// Hard unix-seconds expiry, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl ConnectionConfig {
    /// Parse a `pull.config.get`-style result payload.
    pub fn from_result(result: &serde_json::Value) -> Result<Self, PulseError> {
        serde_json::from_value(result.clone()).map_err(|err| PulseError::Config {
            context: format!("unusable config payload: {err}"),
        })
    }

    /// Whether this config can still be used as-is.
    ///
    /// Invalid once any channel's `end` has passed, the `exp` has
    /// passed, or the server's `config_timestamp` differs from the
    /// locally pinned one.
    #[must_use]
    pub fn is_actual(&self, pinned_timestamp: Option<i64>, now: DateTime<Utc>) -> bool {
        if let Some(pinned) = pinned_timestamp {
            if self.config_timestamp != pinned {
                return false;
            }
        }
        if let Some(exp) = self.exp {
            if now.timestamp() >= exp {
                return false;
            }
        }
        let channels = [&self.channels.private, &self.channels.shared];
        let mut any = false;
        for channel in channels.into_iter().flatten() {
            if channel.is_expired(now) {
                return false;
            }
            any = true;
        }
        // A config addressing nothing (no channel, no jwt) is unusable.
        any || self.jwt.is_some()
    }

    /// Ids of the channels this config subscribes, private first.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<&str> {
        [&self.channels.private, &self.channels.shared]
            .into_iter()
            .flatten()
            .map(|ch| ch.id.as_str())
            .collect()
    }

    /// Whether the socket should speak JSON-RPC.
    #[must_use]
    pub fn json_rpc_mode(&self) -> bool {
        self.transport.protocol_version >= MIN_JSON_RPC_PROTOCOL
    }

    /// Whether publishes use the binary batch format.
    #[must_use]
    pub fn binary_mode(&self) -> bool {
        self.transport.protocol_version >= MIN_BINARY_PROTOCOL
    }

    /// Websocket dial URL with the full query-parameter set.
    pub fn socket_url(
        &self,
        secure: bool,
        resume: Option<&SessionResume>,
    ) -> Result<Url, PulseError> {
        let base = if secure && !self.transport.socket_url_secure.is_empty() {
            &self.transport.socket_url_secure
        } else {
            &self.transport.socket_url
        };
        self.with_query(base, resume)
    }

    /// Long-poll URL with the full query-parameter set.
    pub fn long_poll_url(
        &self,
        secure: bool,
        resume: Option<&SessionResume>,
    ) -> Result<Url, PulseError> {
        let base = if secure && !self.transport.long_poll_url_secure.is_empty() {
            &self.transport.long_poll_url_secure
        } else {
            &self.transport.long_poll_url
        };
        self.with_query(base, resume)
    }

    /// Publish URL (no resume parameters).
    pub fn publish_url(&self, secure: bool) -> Result<Url, PulseError> {
        let base = if secure && !self.transport.publish_url_secure.is_empty() {
            &self.transport.publish_url_secure
        } else {
            &self.transport.publish_url
        };
        self.with_query(base, None)
    }

    fn with_query(&self, base: &str, resume: Option<&SessionResume>) -> Result<Url, PulseError> {
        if base.is_empty() {
            return Err(PulseError::Config {
                context: "transport url missing from config".into(),
            });
        }
        let mut url = Url::parse(base).map_err(|err| PulseError::Config {
            context: format!("bad transport url {base}: {err}"),
        })?;
        {
            let mut query = url.query_pairs_mut();
            // Token and channel ids are mutually exclusive credentials.
            if let Some(jwt) = &self.jwt {
                let _ = query.append_pair("token", jwt);
            } else {
                let _ = query.append_pair("CHANNEL_ID", &self.channel_ids().join("/"));
            }
            let _ = query.append_pair("revision", &REVISION.to_string());
            if self.transport.mode == ConnectionMode::Shared {
                if let Some(client_id) = &self.transport.client_id {
                    let _ = query.append_pair("clientId", client_id);
                }
            }
            if let Some(resume) = resume {
                let _ = query.append_pair("mid", &resume.mid);
                if let Some(tag) = &resume.tag {
                    let _ = query.append_pair("tag", tag);
                }
                if let Some(time) = &resume.time {
                    let _ = query.append_pair("time", time);
                }
            }
        }
        Ok(url)
    }
}

/// What gets persisted in the store alongside the pinned timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedConfig {
    /// The snapshot itself.
    pub config: ConnectionConfig,
    /// Unix millis when it was stored.
    pub stored_at: i64,
}
