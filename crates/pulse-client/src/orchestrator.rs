//! The connection orchestrator.
//!
//! Owns the single long-lived connection of one client instance: fetches
//! and caches the connection config, picks a transport, supervises the
//! link with a keepalive watchdog, admits inbound messages through the
//! revision gate and dedup window, intercepts system commands, and
//! reschedules itself through the backoff table when the link is lost.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use pulse_core::constants::{
    CONFIG_CHECK_INTERVAL_SECS, DEFAULT_PING_INTERVAL_SECS, OFFLINE_DELAY_MS, RECONNECT_DELAY_SECS,
    SERVER_RESTART_DELAY_SECS, SESSION_TTL_SECS, SOCKET_RETRY_COOLDOWN_SECS,
    WATCH_RENEW_INTERVAL_SECS,
};
use pulse_core::{ConnectionStatus, PulseError, REVISION, reconnect_delay_with_jitter};
use pulse_store::{BlockedFlag, CoordinationConfig, KeyValueStore};
use pulse_transport::{
    Connector, LongPollConnector, Payload, RpcCorrelator, SocketConnector, TransportEvent,
};
use pulse_wire::{Envelope, binary, text};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::commands::SystemCommand;
use crate::config::{CachedConfig, ConnectionConfig};
use crate::events::{
    ClientEvent, ONLINE_MODULE, SubscriberKind, SubscriberTable, Subscription, SubscriptionFilter,
};
use crate::method_client::{METHOD_CONFIG_GET, METHOD_WATCH_EXTEND, MethodClient};
use crate::resolver::ChannelResolver;
use crate::session::SessionState;

/// Store key for the cached config snapshot.
const KEY_CONFIG: &str = "config";
/// Store key for the pinned config timestamp.
const KEY_CONFIG_TIMESTAMP: &str = "configTimestamp";
/// Store key for the persisted session continuation.
const KEY_SESSION: &str = "session";

/// Server-initiated RPC method carrying pushed messages.
const METHOD_INCOMING_MESSAGE: &str = "incoming.message";

/// Consecutive socket failures before the flag goes up for all
/// instances.
const SOCKET_FAILURES_BEFORE_BLOCK: u32 = 3;

/// Capacity of the per-connection transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Which physical transport a connection runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent WebSocket.
    Socket,
    /// Long-polling HTTP.
    LongPoll,
}

/// Tuning knobs; defaults come from the compiled constants.
#[derive(Clone, Debug)]
pub struct OrchestratorOptions {
    /// Expected interval between server keepalive pings.
    pub ping_interval: Duration,
    /// Damping before an `Offline` status is surfaced.
    pub offline_delay: Duration,
    /// Delay of a light `reconnect`.
    pub reconnect_delay: Duration,
    /// Backoff after a server-restarting notice.
    pub server_restart_delay: Duration,
    /// Interval between cached-config validity checks.
    pub config_check_interval: Duration,
    /// Interval between watch-tag renewal calls.
    pub watch_renew_interval: Duration,
    /// Cooldown before retrying the socket while on long-poll.
    pub socket_retry_cooldown: Duration,
    /// Per-call timeout for correlated RPC calls.
    pub call_timeout: Duration,
    /// Prefer TLS endpoints when the config offers them.
    pub secure: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            offline_delay: Duration::from_millis(OFFLINE_DELAY_MS),
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            server_restart_delay: Duration::from_secs(SERVER_RESTART_DELAY_SECS),
            config_check_interval: Duration::from_secs(CONFIG_CHECK_INTERVAL_SECS),
            watch_renew_interval: Duration::from_secs(WATCH_RENEW_INTERVAL_SECS),
            socket_retry_cooldown: Duration::from_secs(SOCKET_RETRY_COOLDOWN_SECS),
            call_timeout: Duration::from_secs(30),
            secure: true,
        }
    }
}

/// URL updater paired with a connector (resume parameters advance while
/// a connection is live).
pub type UpdateUrl = Arc<dyn Fn(Url) + Send + Sync>;

/// A connector plus its URL updater, as built by a factory.
pub struct TransportHandle {
    /// The transport.
    pub connector: Arc<dyn Connector>,
    /// Replaces the connector's URL for the next cycle or dial.
    pub update_url: UpdateUrl,
}

/// Builds connectors; swapped out in tests.
pub trait ConnectorFactory: Send + Sync {
    /// Build a WebSocket connector dialing `url`.
    fn socket(&self, url: Url, events: mpsc::Sender<TransportEvent>) -> TransportHandle;

    /// Build a long-poll connector over `poll_url`/`publish_url`.
    fn long_poll(
        &self,
        poll_url: Url,
        publish_url: Url,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportHandle;
}

/// Factory producing the real network connectors.
pub struct DefaultConnectorFactory;

impl ConnectorFactory for DefaultConnectorFactory {
    fn socket(&self, url: Url, events: mpsc::Sender<TransportEvent>) -> TransportHandle {
        let connector = Arc::new(SocketConnector::new(url, events));
        let for_url = Arc::clone(&connector);
        TransportHandle {
            connector,
            update_url: Arc::new(move |url| for_url.set_url(url)),
        }
    }

    fn long_poll(
        &self,
        poll_url: Url,
        publish_url: Url,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportHandle {
        let connector = Arc::new(LongPollConnector::new(poll_url, publish_url, events));
        let for_url = Arc::clone(&connector);
        TransportHandle {
            connector,
            update_url: Arc::new(move |url| for_url.set_url(url)),
        }
    }
}

/// Point-in-time view of the orchestrator for diagnostics.
#[derive(Clone, Debug)]
pub struct DebugSnapshot {
    /// Current connection status.
    pub status: ConnectionStatus,
    /// Transport of the active connection, if any.
    pub transport: Option<TransportKind>,
    /// Consecutive failed connect attempts.
    pub attempts: u32,
    /// Total admitted messages this session.
    pub message_count: u64,
    /// Live subscriber count.
    pub subscribers: usize,
    /// Last sampled server-minus-client clock offset, in milliseconds.
    pub server_time_offset_ms: i64,
}

struct State {
    status: ConnectionStatus,
    attempts: u32,
    socket_failures: u32,
    config: Option<ConnectionConfig>,
    pinned_timestamp: Option<i64>,
    server_time_offset_ms: i64,
}

struct ActiveConnection {
    kind: TransportKind,
    connector: Arc<dyn Connector>,
    correlator: Option<Arc<RpcCorrelator>>,
    cancel: CancellationToken,
}

struct Inner {
    method_client: Arc<dyn MethodClient>,
    store: Arc<dyn KeyValueStore>,
    shared: CoordinationConfig,
    resolver: ChannelResolver,
    factory: Arc<dyn ConnectorFactory>,
    opts: OrchestratorOptions,
    subscribers: Arc<SubscriberTable>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<State>,
    session: Mutex<SessionState>,
    watch_tags: Mutex<HashSet<String>>,
    enabled: AtomicBool,
    revision_emitted: AtomicBool,
    lifecycle: Mutex<Option<CancellationToken>>,
    connection: tokio::sync::Mutex<Option<ActiveConnection>>,
}

/// Messages carried inside a server-initiated `incoming.message` call.
#[derive(Deserialize)]
struct IncomingMessages {
    #[serde(default)]
    messages: Vec<Envelope>,
}

/// Session continuation as stored. Deliberately short-lived: resume
/// data survives a process reload, not an overnight gap.
#[derive(serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    session: SessionState,
    stored_at: i64,
}

/// One long-lived realtime connection for one client instance.
pub struct ConnectionOrchestrator {
    inner: Arc<Inner>,
}

impl ConnectionOrchestrator {
    /// Build an orchestrator over a method client and shared store.
    pub fn new(
        method_client: Arc<dyn MethodClient>,
        store: Arc<dyn KeyValueStore>,
        factory: Arc<dyn ConnectorFactory>,
        opts: OrchestratorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            method_client: Arc::clone(&method_client),
            store: Arc::clone(&store),
            shared: CoordinationConfig::new(store),
            resolver: ChannelResolver::new(method_client),
            factory,
            opts,
            subscribers: Arc::new(SubscriberTable::default()),
            events,
            state: Mutex::new(State {
                status: ConnectionStatus::Offline,
                attempts: 0,
                socket_failures: 0,
                config: None,
                pinned_timestamp: None,
                server_time_offset_ms: 0,
            }),
            session: Mutex::new(SessionState::default()),
            watch_tags: Mutex::new(HashSet::new()),
            enabled: AtomicBool::new(false),
            revision_emitted: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
            connection: tokio::sync::Mutex::new(None),
        });
        Self { inner }
    }

    /// Build with the real network connectors and default options.
    pub fn with_defaults(
        method_client: Arc<dyn MethodClient>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::new(
            method_client,
            store,
            Arc::new(DefaultConnectorFactory),
            OrchestratorOptions::default(),
        )
    }

    /// Start the connection lifecycle.
    ///
    /// A `config_override` is used as-is and never cached; otherwise a
    /// still-valid cached config is reused and the server is only asked
    /// when none exists. An [`PulseError::Authorize`] rejection emits
    /// [`ClientEvent::AuthorizeError`] and halts without retrying.
    pub async fn start(
        &self,
        config_override: Option<ConnectionConfig>,
    ) -> Result<(), PulseError> {
        let inner = &self.inner;
        inner.enabled.store(true, Ordering::Relaxed);
        inner.revision_emitted.store(false, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        if let Some(old) = inner.lifecycle.lock().replace(cancel.clone()) {
            old.cancel();
        }
        Inner::set_status(inner, ConnectionStatus::Connecting);

        let config = match Inner::load_or_fetch_config(inner, config_override).await {
            Ok(config) => config,
            Err(err) => {
                if let PulseError::Authorize { status } = &err {
                    let _ = inner.events.send(ClientEvent::AuthorizeError { status: *status });
                    inner.enabled.store(false, Ordering::Relaxed);
                }
                Inner::set_status(inner, ConnectionStatus::Offline);
                return Err(err);
            }
        };
        inner.state.lock().config = Some(config);
        Inner::load_persisted_session(inner);

        Inner::spawn_lifecycle_tasks(inner, &cancel);
        Inner::connect(Arc::clone(inner), cancel).await;
        Ok(())
    }

    /// Stop: tear down the connection and every background task. The
    /// config cache and session state survive for the next `start`.
    pub async fn stop(&self, code: u16, reason: &str) {
        let inner = &self.inner;
        info!(code, reason, "stopping client");
        inner.enabled.store(false, Ordering::Relaxed);
        if let Some(cancel) = inner.lifecycle.lock().take() {
            cancel.cancel();
        }
        Inner::drop_connection(inner, code, reason).await;
        Inner::set_status(inner, ConnectionStatus::Offline);
    }

    /// Full restart: drop the cached config and session, refetch, and
    /// reconnect from scratch.
    pub async fn restart(&self, code: u16, reason: &str) -> Result<(), PulseError> {
        let inner = &self.inner;
        info!(code, reason, "restarting client");
        Inner::drop_connection(inner, code, reason).await;
        Inner::clear_cached_config(inner);
        inner.resolver.clear();
        {
            let mut state = inner.state.lock();
            state.config = None;
            state.attempts = 0;
            state.socket_failures = 0;
        }
        *inner.session.lock() = SessionState::default();
        if let Err(err) = inner.store.remove(KEY_SESSION) {
            debug!(%err, "failed to clear persisted session");
        }
        self.start(None).await
    }

    /// Light reconnect: redial with the existing config after a short
    /// fixed delay. Session state is kept, so delivery resumes.
    pub async fn reconnect(&self) {
        let inner = &self.inner;
        Inner::drop_connection(inner, 1000, "reconnect").await;
        Inner::set_status(inner, ConnectionStatus::Connecting);
        Inner::schedule_connect_after(inner, inner.opts.reconnect_delay);
    }

    /// Register a message subscriber; drop the subscription to
    /// unsubscribe.
    #[must_use]
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.inner.subscribers.add(filter)
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Last sampled server-minus-client clock offset, in milliseconds.
    #[must_use]
    pub fn server_time_offset_ms(&self) -> i64 {
        self.inner.state.lock().server_time_offset_ms
    }

    /// Publish an envelope directly to a set of users.
    ///
    /// Receivers are resolved through the public-id cache (misses go out
    /// in one batched list call); users the server does not return are
    /// skipped. Returns the number of receivers the message was
    /// addressed to, which can be zero.
    pub async fn publish(
        &self,
        user_ids: &[u64],
        envelope: &Envelope,
        expiry: u32,
    ) -> Result<usize, PulseError> {
        let inner = &self.inner;
        let config = inner
            .state
            .lock()
            .config
            .clone()
            .ok_or_else(|| PulseError::Publish {
                reason: "client not started".into(),
            })?;
        if !config.transport.publish_enabled {
            return Err(PulseError::Publish {
                reason: "publishing disabled by server config".into(),
            });
        }
        let resolved = inner.resolver.resolve(user_ids).await;
        if resolved.is_empty() {
            return Ok(0);
        }

        let body = serde_json::to_string(envelope).map_err(|err| PulseError::Publish {
            reason: format!("unencodable envelope: {err}"),
        })?;

        let guard = inner.connection.lock().await;
        let Some(conn) = guard.as_ref() else {
            return Err(PulseError::Publish {
                reason: "no active connection".into(),
            });
        };
        if let Some(rpc) = &conn.correlator {
            let receivers: Vec<Value> = resolved
                .values()
                .map(|d| json!({"id": d.public_id, "signature": d.signature}))
                .collect();
            let params = json!({"receivers": receivers, "body": body, "expiry": expiry});
            let _ = rpc.call("publish", params, inner.opts.call_timeout).await?;
            return Ok(resolved.len());
        }

        let payload = if config.binary_mode() {
            let receivers = resolved
                .values()
                .map(|d| binary::Receiver {
                    id: d.public_id.clone(),
                    signature: d.signature.clone(),
                })
                .collect();
            let batch = binary::publish_batch(receivers, body, expiry);
            Payload::Binary(binary::encode_request_batch(&batch))
        } else {
            Payload::Text(text::encode_frame(envelope)?)
        };
        if conn.connector.send(payload).await {
            Ok(resolved.len())
        } else {
            Err(PulseError::Publish {
                reason: "transport refused publish".into(),
            })
        }
    }

    /// Start renewing a watch tag periodically.
    pub fn add_watch(&self, tag: impl Into<String>) {
        let _ = self.inner.watch_tags.lock().insert(tag.into());
    }

    /// Stop renewing a watch tag.
    pub fn remove_watch(&self, tag: &str) {
        let _ = self.inner.watch_tags.lock().remove(tag);
    }

    /// Diagnostics snapshot.
    pub async fn debug_snapshot(&self) -> DebugSnapshot {
        let transport = self.inner.connection.lock().await.as_ref().map(|c| c.kind);
        let (status, attempts, server_time_offset_ms) = {
            let state = self.inner.state.lock();
            (state.status, state.attempts, state.server_time_offset_ms)
        };
        DebugSnapshot {
            status,
            transport,
            attempts,
            message_count: self.inner.session.lock().message_count,
            subscribers: self.inner.subscribers.len(),
            server_time_offset_ms,
        }
    }
}

impl Inner {
    // ── config ──────────────────────────────────────────────────────

    async fn load_or_fetch_config(
        inner: &Arc<Self>,
        config_override: Option<ConnectionConfig>,
    ) -> Result<ConnectionConfig, PulseError> {
        if let Some(config) = config_override {
            inner.state.lock().pinned_timestamp = Some(config.config_timestamp);
            return Ok(config);
        }

        let pinned = inner
            .store
            .get(KEY_CONFIG_TIMESTAMP)
            .ok()
            .flatten()
            .and_then(|raw| raw.parse::<i64>().ok());
        if let Ok(Some(raw)) = inner.store.get(KEY_CONFIG) {
            if let Ok(cached) = serde_json::from_str::<CachedConfig>(&raw) {
                if cached.config.is_actual(pinned, Utc::now()) {
                    debug!("reusing cached config");
                    inner.state.lock().pinned_timestamp = pinned;
                    return Ok(cached.config);
                }
            }
        }

        let response = inner.method_client.call(METHOD_CONFIG_GET, json!({})).await?;
        if let Some(server_time) = response.server_time {
            let offset = server_time.timestamp_millis() - Utc::now().timestamp_millis();
            inner.state.lock().server_time_offset_ms = offset;
        }
        let config = ConnectionConfig::from_result(&response.result)?;
        info!(
            config_timestamp = config.config_timestamp,
            protocol_version = config.transport.protocol_version,
            "fetched fresh config"
        );
        inner.state.lock().pinned_timestamp = Some(config.config_timestamp);
        if let Err(err) = inner
            .store
            .set(KEY_CONFIG_TIMESTAMP, &config.config_timestamp.to_string())
        {
            debug!(%err, "failed to pin config timestamp");
        }
        Self::cache_config(inner, &config);
        Ok(config)
    }

    fn cache_config(inner: &Arc<Self>, config: &ConnectionConfig) {
        let cached = CachedConfig {
            config: config.clone(),
            stored_at: Utc::now().timestamp_millis(),
        };
        match serde_json::to_string(&cached) {
            Ok(raw) => {
                if let Err(err) = inner.store.set(KEY_CONFIG, &raw) {
                    debug!(%err, "failed to cache config");
                }
            }
            Err(err) => debug!(%err, "failed to encode config cache"),
        }
    }

    fn clear_cached_config(inner: &Arc<Self>) {
        for key in [KEY_CONFIG, KEY_CONFIG_TIMESTAMP] {
            if let Err(err) = inner.store.remove(key) {
                debug!(key, %err, "failed to clear config cache");
            }
        }
    }

    async fn refresh_and_reconnect(inner: Arc<Self>) {
        if !inner.enabled.load(Ordering::Relaxed) {
            return;
        }
        Self::drop_connection(&inner, 1000, "config refresh").await;
        Self::clear_cached_config(&inner);
        match Self::load_or_fetch_config(&inner, None).await {
            Ok(config) => {
                inner.state.lock().config = Some(config);
                let token = inner.lifecycle.lock().clone();
                if let Some(cancel) = token {
                    Self::connect(inner, cancel).await;
                }
            }
            Err(err) => {
                if let PulseError::Authorize { status } = &err {
                    let _ = inner.events.send(ClientEvent::AuthorizeError { status: *status });
                    inner.enabled.store(false, Ordering::Relaxed);
                }
                warn!(%err, "config refresh failed");
                Self::set_status(&inner, ConnectionStatus::Offline);
            }
        }
    }

    // ── connection lifecycle ────────────────────────────────────────

    // Boxed so the connect → on_transport_lost → spawn(connect) cycle
    // has an explicitly `Send` future the compiler can name.
    fn connect(
        inner: Arc<Self>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(Self::connect_inner(inner, cancel))
    }

    async fn connect_inner(inner: Arc<Self>, cancel: CancellationToken) {
        if !inner.enabled.load(Ordering::Relaxed) || cancel.is_cancelled() {
            return;
        }
        let Some(config) = inner.state.lock().config.clone() else {
            return;
        };
        let kind = if config.transport.socket_enabled
            && !inner.shared.is_blocked(BlockedFlag::Socket)
        {
            TransportKind::Socket
        } else {
            TransportKind::LongPoll
        };
        let resume = inner.session.lock().resume();
        let secure = inner.opts.secure;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let built = match kind {
            TransportKind::Socket => config
                .socket_url(secure, resume.as_ref())
                .map(|url| inner.factory.socket(url, events_tx)),
            TransportKind::LongPoll => config.long_poll_url(secure, resume.as_ref()).and_then(
                |poll| {
                    let publish = config.publish_url(secure)?;
                    Ok(inner.factory.long_poll(poll, publish, events_tx))
                },
            ),
        };
        let handle = match built {
            Ok(handle) => handle,
            Err(err) => {
                warn!(%err, ?kind, "cannot build transport url");
                Self::set_status(&inner, ConnectionStatus::Offline);
                return;
            }
        };

        let correlator = (kind == TransportKind::Socket && config.json_rpc_mode())
            .then(|| Arc::new(RpcCorrelator::new(Arc::clone(&handle.connector))));
        let (admitted_tx, admitted_rx) = mpsc::unbounded_channel();
        if let Some(rpc) = &correlator {
            rpc.register_handler(
                METHOD_INCOMING_MESSAGE,
                Arc::new(move |params| {
                    match serde_json::from_value::<IncomingMessages>(params) {
                        Ok(incoming) => {
                            for envelope in incoming.messages {
                                let _ = admitted_tx.send(envelope);
                            }
                        }
                        Err(err) => warn!(%err, "unusable incoming.message payload"),
                    }
                    Ok(Value::Null)
                }),
            );
        }

        // Dial before superseding: a still-working link is only torn
        // down once its replacement is actually up, so a failed dial
        // (say, a background socket retry) leaves it untouched.
        let conn_cancel = cancel.child_token();
        match handle.connector.connect().await {
            Ok(()) => {
                {
                    let mut guard = inner.connection.lock().await;
                    if let Some(old) = guard.take() {
                        old.cancel.cancel();
                        if let Some(rpc) = &old.correlator {
                            rpc.cancel_all();
                        }
                        old.connector.disconnect(1000, "superseded").await;
                    }
                    *guard = Some(ActiveConnection {
                        kind,
                        connector: Arc::clone(&handle.connector),
                        correlator: correlator.clone(),
                        cancel: conn_cancel.clone(),
                    });
                }
                {
                    let mut state = inner.state.lock();
                    state.attempts = 0;
                    if kind == TransportKind::Socket {
                        state.socket_failures = 0;
                    }
                }
                Self::set_status(&inner, ConnectionStatus::Online);
                info!(?kind, "connected");
                if let Some(rpc) = &correlator {
                    drop(tokio::spawn(Self::keepalive(
                        Arc::clone(&inner),
                        rpc.ping_seen_flag(),
                        conn_cancel.clone(),
                    )));
                }
                drop(tokio::spawn(Self::pump(
                    inner,
                    kind,
                    config,
                    events_rx,
                    admitted_rx,
                    correlator,
                    handle.update_url,
                    conn_cancel,
                )));
            }
            Err(err) => {
                let still_up = inner
                    .connection
                    .lock()
                    .await
                    .as_ref()
                    .is_some_and(|c| c.connector.connected());
                if still_up {
                    debug!(%err, ?kind, "dial failed, keeping current transport");
                } else {
                    debug!(%err, ?kind, "connect failed");
                    Self::on_transport_lost(&inner, kind).await;
                }
            }
        }
    }

    async fn drop_connection(inner: &Arc<Self>, code: u16, reason: &str) {
        let taken = inner.connection.lock().await.take();
        if let Some(conn) = taken {
            conn.cancel.cancel();
            if let Some(rpc) = &conn.correlator {
                rpc.cancel_all();
            }
            conn.connector.disconnect(code, reason).await;
        }
    }

    // ── session persistence ─────────────────────────────────────────

    fn load_persisted_session(inner: &Arc<Self>) {
        let Ok(Some(raw)) = inner.store.get(KEY_SESSION) else {
            return;
        };
        let Ok(persisted) = serde_json::from_str::<PersistedSession>(&raw) else {
            return;
        };
        #[allow(clippy::cast_possible_wrap)]
        let ttl_ms = (SESSION_TTL_SECS * 1000) as i64;
        let age_ms = Utc::now().timestamp_millis() - persisted.stored_at;
        if (0..ttl_ms).contains(&age_ms) {
            debug!(mid = ?persisted.session.mid, "resuming persisted session");
            *inner.session.lock() = persisted.session;
        }
    }

    fn persist_session(inner: &Arc<Self>) {
        let persisted = PersistedSession {
            session: inner.session.lock().clone(),
            stored_at: Utc::now().timestamp_millis(),
        };
        match serde_json::to_string(&persisted) {
            Ok(raw) => {
                if let Err(err) = inner.store.set(KEY_SESSION, &raw) {
                    debug!(%err, "failed to persist session");
                }
            }
            Err(err) => debug!(%err, "failed to encode session"),
        }
    }

    async fn on_transport_lost(inner: &Arc<Self>, kind: TransportKind) {
        if !inner.enabled.load(Ordering::Relaxed) {
            return;
        }
        let (attempts, socket_failures) = {
            let mut state = inner.state.lock();
            state.attempts += 1;
            if kind == TransportKind::Socket {
                state.socket_failures += 1;
            }
            (state.attempts, state.socket_failures)
        };
        if kind == TransportKind::Socket && socket_failures == SOCKET_FAILURES_BEFORE_BLOCK {
            warn!("socket failing repeatedly, marking it blocked for all instances");
            inner.shared.set_blocked(BlockedFlag::Socket, true);
        }
        Self::set_status(inner, ConnectionStatus::Connecting);
        Self::schedule_offline_notice(inner);

        let delay = Duration::from_millis(reconnect_delay_with_jitter(
            attempts - 1,
            rand::random::<f64>(),
        ));
        debug!(attempt = attempts, ?delay, "reconnect scheduled");
        Self::schedule_connect_after(inner, delay);
    }

    fn schedule_connect_after(inner: &Arc<Self>, delay: Duration) {
        let token = inner.lifecycle.lock().clone();
        let Some(cancel) = token else { return };
        let inner = Arc::clone(inner);
        drop(tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    Self::connect(inner, cancel).await;
                }
            }
        }));
    }

    fn schedule_offline_notice(inner: &Arc<Self>) {
        let token = inner.lifecycle.lock().clone();
        let Some(cancel) = token else { return };
        let inner = Arc::clone(inner);
        drop(tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(inner.opts.offline_delay) => {
                    let still_down = inner.state.lock().status == ConnectionStatus::Connecting;
                    if still_down && inner.enabled.load(Ordering::Relaxed) {
                        Self::set_status(&inner, ConnectionStatus::Offline);
                    }
                }
            }
        }));
    }

    /// Revision gate or host-side fatal condition: tear everything down
    /// and stay down.
    async fn shutdown(inner: &Arc<Self>) {
        inner.enabled.store(false, Ordering::Relaxed);
        if let Some(cancel) = inner.lifecycle.lock().take() {
            cancel.cancel();
        }
        Self::drop_connection(inner, 1000, "client disabled").await;
        Self::set_status(inner, ConnectionStatus::Offline);
    }

    // ── inbound path ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn pump(
        inner: Arc<Self>,
        kind: TransportKind,
        config: ConnectionConfig,
        mut events_rx: mpsc::Receiver<TransportEvent>,
        mut admitted_rx: mpsc::UnboundedReceiver<Envelope>,
        correlator: Option<Arc<RpcCorrelator>>,
        update_url: UpdateUrl,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                envelope = admitted_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    Self::admit(&inner, envelope, SubscriberKind::Server).await;
                }
                event = events_rx.recv() => {
                    match event {
                        Some(TransportEvent::Connected) => {}
                        Some(TransportEvent::Message(Payload::Text(raw))) => {
                            if let Some(rpc) = &correlator {
                                rpc.dispatch(&raw).await;
                            } else {
                                for envelope in text::decode_frames(&raw) {
                                    Self::admit(&inner, envelope, SubscriberKind::Server).await;
                                }
                                Self::advance_poll_url(&inner, kind, &config, &update_url);
                            }
                        }
                        Some(TransportEvent::Message(Payload::Binary(bytes))) => {
                            Self::admit_binary(&inner, &bytes).await;
                            Self::advance_poll_url(&inner, kind, &config, &update_url);
                        }
                        Some(TransportEvent::Disconnected { code, reason }) => {
                            warn!(code, %reason, ?kind, "transport lost");
                            if let Some(rpc) = &correlator {
                                rpc.cancel_all();
                            }
                            Self::on_transport_lost(&inner, kind).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Rebuild the poll URL so the next cycle resumes past what was
    /// just admitted. No-op on the socket, which dials once.
    fn advance_poll_url(
        inner: &Arc<Self>,
        kind: TransportKind,
        config: &ConnectionConfig,
        update_url: &UpdateUrl,
    ) {
        if kind != TransportKind::LongPoll {
            return;
        }
        let resume = inner.session.lock().resume();
        match config.long_poll_url(inner.opts.secure, resume.as_ref()) {
            Ok(url) => update_url(url),
            Err(err) => debug!(%err, "cannot advance poll url"),
        }
    }

    async fn admit_binary(inner: &Arc<Self>, bytes: &[u8]) {
        let batch = match binary::decode_response_batch(bytes) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%err, "dropping undecodable binary batch");
                return;
            }
        };
        for response in batch.responses {
            let Some(outgoing) = response.outgoing_messages else {
                continue;
            };
            for message in outgoing.messages {
                let kind = match message.sender.as_ref().map(|s| s.r#type) {
                    Some(t) if t == binary::SenderType::Client as i32 => SubscriberKind::Client,
                    _ => SubscriberKind::Server,
                };
                match serde_json::from_str::<Envelope>(&message.body) {
                    Ok(envelope) => Self::admit(inner, envelope, kind).await,
                    Err(err) => warn!(%err, id = %message.id, "dropping unparseable message body"),
                }
            }
        }
    }

    async fn admit(inner: &Arc<Self>, envelope: Envelope, kind: SubscriberKind) {
        if let Some(server) = envelope.server_revision() {
            if server != 0 && server != REVISION {
                if !inner.revision_emitted.swap(true, Ordering::Relaxed) {
                    warn!(server, client = REVISION, "incompatible protocol revision, disabling");
                    let _ = inner.events.send(ClientEvent::RevisionMismatch {
                        server,
                        client: REVISION,
                    });
                    Self::shutdown(inner).await;
                }
                return;
            }
        }
        if let Some(server_ms) = envelope.extra.as_ref().and_then(|e| e.server_time_unix) {
            #[allow(clippy::cast_possible_truncation)]
            let offset = server_ms as i64 - Utc::now().timestamp_millis();
            inner.state.lock().server_time_offset_ms = offset;
        }
        if !inner.session.lock().accept(&envelope) {
            debug!(mid = ?envelope.mid, "duplicate message dropped");
            return;
        }
        Self::persist_session(inner);
        if let Some(command) = SystemCommand::parse(&envelope) {
            Self::handle_system_command(inner, command).await;
            return;
        }
        let kind = if envelope.module_id == ONLINE_MODULE {
            SubscriberKind::Online
        } else {
            kind
        };
        inner.subscribers.dispatch(&envelope, kind);
    }

    async fn handle_system_command(inner: &Arc<Self>, command: SystemCommand) {
        match command {
            SystemCommand::ChannelExpired {
                reconnect,
                replacement,
            } => {
                info!(reconnect, swap = replacement.is_some(), "channel expired server-side");
                let has_replacement = replacement.is_some();
                if let Some(channel) = replacement {
                    let swapped = {
                        let mut state = inner.state.lock();
                        if let Some(config) = state.config.as_mut() {
                            config.channels.private = Some(channel);
                            state.config.clone()
                        } else {
                            None
                        }
                    };
                    if let Some(config) = swapped {
                        Self::cache_config(inner, &config);
                    }
                }
                if reconnect && has_replacement {
                    Self::drop_connection(inner, 1000, "channel expired").await;
                    Self::schedule_connect_after(inner, inner.opts.reconnect_delay);
                } else {
                    // Without a replacement grant the expired channel is
                    // gone for good; go back through the fetch path.
                    let inner = Arc::clone(inner);
                    drop(tokio::spawn(Self::refresh_and_reconnect(inner)));
                }
            }
            SystemCommand::ConfigExpired => {
                info!("config expired server-side, refetching");
                let inner = Arc::clone(inner);
                drop(tokio::spawn(Self::refresh_and_reconnect(inner)));
            }
            SystemCommand::ServerRestart => {
                info!("server restarting, backing off before redial");
                Self::drop_connection(inner, 1000, "server restart").await;
                Self::set_status(inner, ConnectionStatus::Connecting);
                Self::schedule_connect_after(inner, inner.opts.server_restart_delay);
            }
            SystemCommand::Unknown(name) => {
                debug!(%name, "ignoring unknown system command");
            }
        }
    }

    // ── supervision ─────────────────────────────────────────────────

    /// Stuck-connection detector: a live socket must see a server ping
    /// every interval; two silent intervals in a row mean the link is
    /// dead even if the OS still thinks it is open.
    async fn keepalive(
        inner: Arc<Self>,
        ping_seen: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(inner.opts.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = interval.tick().await; // immediate first tick
        let mut misses = 0u32;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if ping_seen.swap(false, Ordering::Relaxed) {
                        misses = 0;
                    } else {
                        misses += 1;
                        if misses >= 2 {
                            warn!("no keepalive ping for two intervals, dropping stuck connection");
                            Self::drop_connection(&inner, 1000, "keepalive timeout").await;
                            Self::on_transport_lost(&inner, TransportKind::Socket).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn spawn_lifecycle_tasks(inner: &Arc<Self>, cancel: &CancellationToken) {
        drop(tokio::spawn(Self::config_check_loop(
            Arc::clone(inner),
            cancel.clone(),
        )));
        drop(tokio::spawn(Self::watch_renew_loop(
            Arc::clone(inner),
            cancel.clone(),
        )));
        drop(tokio::spawn(Self::socket_retry_loop(
            Arc::clone(inner),
            cancel.clone(),
        )));

        let watcher = Arc::clone(inner);
        let _ = inner.shared.spawn_socket_blocked_watch(
            move |blocked| {
                let inner = Arc::clone(&watcher);
                drop(tokio::spawn(async move {
                    let active = inner.connection.lock().await.as_ref().map(|c| c.kind);
                    let should_switch = match active {
                        Some(TransportKind::Socket) => blocked,
                        Some(TransportKind::LongPoll) => !blocked,
                        None => false,
                    };
                    if should_switch {
                        info!(blocked, "socket flag flipped elsewhere, re-evaluating transport");
                        let token = inner.lifecycle.lock().clone();
                        if let Some(cancel) = token {
                            Self::connect(inner, cancel).await;
                        }
                    }
                }));
            },
            cancel.clone(),
        );
    }

    async fn config_check_loop(inner: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(inner.opts.config_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let stale = {
                        let state = inner.state.lock();
                        match &state.config {
                            Some(config) => !config.is_actual(state.pinned_timestamp, Utc::now()),
                            None => false,
                        }
                    };
                    if stale {
                        info!("config no longer valid, refreshing");
                        Self::refresh_and_reconnect(Arc::clone(&inner)).await;
                    }
                }
            }
        }
    }

    async fn watch_renew_loop(inner: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(inner.opts.watch_renew_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let tags: Vec<String> = inner.watch_tags.lock().iter().cloned().collect();
                    if tags.is_empty() {
                        continue;
                    }
                    match inner
                        .method_client
                        .call(METHOD_WATCH_EXTEND, json!({"watchTags": tags}))
                        .await
                    {
                        Ok(response) => {
                            let invalid = response
                                .result
                                .get("invalidTags")
                                .and_then(Value::as_array)
                                .map(|tags| {
                                    tags.iter()
                                        .filter_map(Value::as_str)
                                        .map(str::to_string)
                                        .collect::<Vec<_>>()
                                })
                                .unwrap_or_default();
                            if !invalid.is_empty() {
                                debug!(count = invalid.len(), "dropping invalid watch tags");
                                let mut held = inner.watch_tags.lock();
                                for tag in &invalid {
                                    let _ = held.remove(tag);
                                }
                            }
                        }
                        Err(err) => debug!(%err, "watch renewal failed"),
                    }
                }
            }
        }
    }

    /// While running on long-poll, periodically retry the socket in
    /// case it recovered (or its blocked flag aged out). The retry is
    /// passive: the long-poll link carries traffic until the socket
    /// dial succeeds, and stays up if it does not.
    async fn socket_retry_loop(inner: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(inner.opts.socket_retry_cooldown);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let on_long_poll = inner
                        .connection
                        .lock()
                        .await
                        .as_ref()
                        .is_some_and(|c| c.kind == TransportKind::LongPoll);
                    let socket_usable = {
                        let state = inner.state.lock();
                        state
                            .config
                            .as_ref()
                            .is_some_and(|c| c.transport.socket_enabled)
                    } && !inner.shared.is_blocked(BlockedFlag::Socket);
                    if on_long_poll && socket_usable {
                        info!("retrying socket transport");
                        inner.state.lock().socket_failures = 0;
                        let token = inner.lifecycle.lock().clone();
                        if let Some(cancel) = token {
                            Self::connect(Arc::clone(&inner), cancel).await;
                        }
                    }
                }
            }
        }
    }

    // ── status ──────────────────────────────────────────────────────

    fn set_status(inner: &Arc<Self>, status: ConnectionStatus) {
        let changed = {
            let mut state = inner.state.lock();
            if state.status == status {
                false
            } else {
                state.status = status;
                true
            }
        };
        if changed {
            debug!(%status, "status changed");
            let _ = inner.events.send(ClientEvent::Status(status));
        }
    }
}
