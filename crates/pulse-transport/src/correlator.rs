//! Request/response correlation over a JSON-RPC transport.
//!
//! Wraps a [`Connector`] to provide correlated calls (numeric id,
//! per-call timeout), inbound command dispatch to registered handlers,
//! and the bare ping/pong keepalive. Malformed frames are logged and
//! dropped; the link is never torn down from here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use pulse_core::PulseError;
use pulse_wire::jsonrpc::{self, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcFrame};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connector::{Connector, Payload};

/// Handler for a server-initiated call.
pub type HandlerFn = Arc<dyn Fn(Value) -> Result<Value, JsonRpcError> + Send + Sync>;

type PendingTx = oneshot::Sender<Result<Value, JsonRpcError>>;

/// Correlates outgoing calls with asynchronous replies.
pub struct RpcCorrelator {
    connector: Arc<dyn Connector>,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingTx>,
    handlers: DashMap<String, HandlerFn>,
    // Set on every inbound ping; the keepalive watchdog checks and
    // clears it (the stuck-connection detector).
    ping_seen: Arc<AtomicBool>,
}

impl RpcCorrelator {
    /// Wrap a connector.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            ping_seen: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag flipped by every inbound keepalive ping.
    #[must_use]
    pub fn ping_seen_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ping_seen)
    }

    /// Number of calls still awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register a handler for a server-initiated method.
    pub fn register_handler(&self, method: impl Into<String>, handler: HandlerFn) {
        let _ = self.handlers.insert(method.into(), handler);
    }

    /// Issue a correlated call and await its reply.
    ///
    /// The pending entry is removed on the matching response or on
    /// timeout, whichever comes first; a late response for the id is
    /// then logged and ignored.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, PulseError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.insert(id, tx);

        let request = JsonRpcRequest::new(method, params, id);
        let raw = match serde_json::to_string(&request) {
            Ok(raw) => raw,
            Err(err) => {
                let _ = self.pending.remove(&id);
                return Err(PulseError::protocol(format!("encode call: {err}")));
            }
        };
        if !self.connector.send(Payload::Text(raw)).await {
            let _ = self.pending.remove(&id);
            return Err(PulseError::transport(format!("send {method} refused")));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(rpc_err))) => Err(PulseError::Protocol {
                context: format!("rpc {method} failed ({}): {}", rpc_err.code, rpc_err.message),
            }),
            Ok(Err(_dropped)) => Err(PulseError::transport(format!(
                "connection closed awaiting {method}"
            ))),
            Err(_elapsed) => {
                let _ = self.pending.remove(&id);
                #[allow(clippy::cast_possible_truncation)]
                Err(PulseError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                    context: format!("rpc {method} (id {id})"),
                })
            }
        }
    }

    /// Route one raw inbound message.
    ///
    /// Handles the bare keepalive, then parses a single frame or a
    /// batch: responses go to pending callers, requests to handlers
    /// (an unregistered method gets a structured method-not-found
    /// reply), anything malformed is logged and dropped.
    pub async fn dispatch(&self, raw: &str) {
        if raw == jsonrpc::PING {
            self.ping_seen.store(true, Ordering::Relaxed);
            let _ = self
                .connector
                .send(Payload::Text(jsonrpc::PONG.to_string()))
                .await;
            return;
        }
        if raw == jsonrpc::PONG {
            return;
        }

        let frames = match jsonrpc::parse_frames(raw) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(%err, "dropping undecodable rpc message");
                return;
            }
        };
        for frame in frames {
            match frame {
                RpcFrame::Response(response) => self.route_response(response),
                RpcFrame::Request(request) => self.route_request(request).await,
            }
        }
    }

    /// Reject every outstanding call (explicit disconnect). Callers see
    /// a transport error.
    pub fn cancel_all(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let _ = self.pending.remove(&id);
        }
    }

    fn route_response(&self, response: JsonRpcResponse) {
        let Some((_, tx)) = self.pending.remove(&response.id) else {
            debug!(id = response.id, "late or unknown rpc response, ignoring");
            return;
        };
        let outcome = match (response.result, response.error) {
            (_, Some(err)) => Err(err),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        let _ = tx.send(outcome);
    }

    async fn route_request(&self, request: JsonRpcRequest) {
        let reply = match self.handlers.get(&request.method) {
            Some(handler) => {
                let result = handler(request.params);
                request.id.map(|id| match result {
                    Ok(value) => JsonRpcResponse::success(id, value),
                    Err(err) => JsonRpcResponse {
                        jsonrpc: jsonrpc::JSONRPC_VERSION.into(),
                        result: None,
                        error: Some(err),
                        id,
                    },
                })
            }
            None => {
                warn!(method = %request.method, "no handler for server call");
                request
                    .id
                    .map(|id| JsonRpcResponse::method_not_found(id, &request.method))
            }
        };
        if let Some(reply) = reply {
            match serde_json::to_string(&reply) {
                Ok(raw) => {
                    let _ = self.connector.send(Payload::Text(raw)).await;
                }
                Err(err) => warn!(%err, "failed to encode rpc reply"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Test double that records sends and never touches the network.
    struct RecordingConnector {
        sent: Mutex<Vec<Payload>>,
        accept: AtomicBool,
    }

    impl RecordingConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                accept: AtomicBool::new(true),
            })
        }

        fn sent_texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter_map(|p| match p {
                    Payload::Text(t) => Some(t.clone()),
                    Payload::Binary(_) => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn connect(&self) -> Result<(), PulseError> {
            Ok(())
        }
        async fn disconnect(&self, _code: u16, _reason: &str) {}
        async fn send(&self, payload: Payload) -> bool {
            if !self.accept.load(Ordering::Relaxed) {
                return false;
            }
            self.sent.lock().push(payload);
            true
        }
        fn connected(&self) -> bool {
            true
        }
    }

    // ── call correlation ────────────────────────────────────────────

    #[tokio::test]
    async fn call_resolves_on_matching_response() {
        let connector = RecordingConnector::new();
        let rpc = Arc::new(RpcCorrelator::new(connector.clone()));

        let rpc2 = Arc::clone(&rpc);
        let call = tokio::spawn(async move {
            rpc2.call("publish", json!({"k": 1}), Duration::from_secs(5))
                .await
        });

        // Wait for the request to hit the wire, then answer it.
        tokio::task::yield_now().await;
        while connector.sent_texts().is_empty() {
            tokio::task::yield_now().await;
        }
        let sent: Value = serde_json::from_str(&connector.sent_texts()[0]).unwrap();
        assert_eq!(sent["method"], "publish");
        let id = sent["id"].as_u64().unwrap();

        rpc.dispatch(&format!(
            r#"{{"jsonrpc":"2.0","result":{{"ok":true}},"id":{id}}}"#
        ))
        .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_ids_are_monotonic() {
        let connector = RecordingConnector::new();
        let rpc = RpcCorrelator::new(connector.clone());

        let _ = rpc.call("a", json!({}), Duration::from_millis(1)).await;
        let _ = rpc.call("b", json!({}), Duration::from_millis(1)).await;

        let texts = connector.sent_texts();
        let id_a = serde_json::from_str::<Value>(&texts[0]).unwrap()["id"]
            .as_u64()
            .unwrap();
        let id_b = serde_json::from_str::<Value>(&texts[1]).unwrap()["id"]
            .as_u64()
            .unwrap();
        assert!(id_b > id_a);
    }

    #[tokio::test]
    async fn call_timeout_removes_pending_and_late_response_is_ignored() {
        let connector = RecordingConnector::new();
        let rpc = RpcCorrelator::new(connector.clone());

        let err = rpc
            .call("slow", json!({}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_matches!(err, PulseError::Timeout { .. });
        assert_eq!(rpc.pending_count(), 0);

        // A late response for the expired id is dropped without effect.
        let sent: Value = serde_json::from_str(&connector.sent_texts()[0]).unwrap();
        let id = sent["id"].as_u64().unwrap();
        rpc.dispatch(&format!(r#"{{"jsonrpc":"2.0","result":1,"id":{id}}}"#))
            .await;
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_error_response_surfaces_as_protocol_error() {
        let connector = RecordingConnector::new();
        let rpc = Arc::new(RpcCorrelator::new(connector.clone()));

        let rpc2 = Arc::clone(&rpc);
        let call = tokio::spawn(async move {
            rpc2.call("publish", json!({}), Duration::from_secs(5)).await
        });
        while connector.sent_texts().is_empty() {
            tokio::task::yield_now().await;
        }
        let sent: Value = serde_json::from_str(&connector.sent_texts()[0]).unwrap();
        let id = sent["id"].as_u64().unwrap();

        rpc.dispatch(&format!(
            r#"{{"jsonrpc":"2.0","error":{{"code":-32603,"message":"boom"}},"id":{id}}}"#
        ))
        .await;

        let err = call.await.unwrap().unwrap_err();
        assert_matches!(err, PulseError::Protocol { .. });
    }

    #[tokio::test]
    async fn call_refused_send_is_transport_error() {
        let connector = RecordingConnector::new();
        connector.accept.store(false, Ordering::Relaxed);
        let rpc = RpcCorrelator::new(connector.clone());

        let err = rpc
            .call("x", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(err, PulseError::Transport { .. });
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_all_rejects_outstanding_calls() {
        let connector = RecordingConnector::new();
        let rpc = Arc::new(RpcCorrelator::new(connector.clone()));

        let rpc2 = Arc::clone(&rpc);
        let call = tokio::spawn(async move {
            rpc2.call("hanging", json!({}), Duration::from_secs(30)).await
        });
        while rpc.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        rpc.cancel_all();
        let err = call.await.unwrap().unwrap_err();
        assert_matches!(err, PulseError::Transport { .. });
    }

    // ── inbound dispatch ────────────────────────────────────────────

    #[tokio::test]
    async fn ping_gets_pong_and_sets_flag() {
        let connector = RecordingConnector::new();
        let rpc = RpcCorrelator::new(connector.clone());
        let flag = rpc.ping_seen_flag();
        assert!(!flag.load(Ordering::Relaxed));

        rpc.dispatch("ping").await;

        assert!(flag.load(Ordering::Relaxed));
        assert_eq!(connector.sent_texts(), vec!["pong".to_string()]);
    }

    #[tokio::test]
    async fn registered_handler_gets_request_and_replies() {
        let connector = RecordingConnector::new();
        let rpc = RpcCorrelator::new(connector.clone());
        rpc.register_handler(
            "incoming.message",
            Arc::new(|params| Ok(json!({"echo": params["n"]}))),
        );

        rpc.dispatch(r#"{"jsonrpc":"2.0","method":"incoming.message","params":{"n":7},"id":42}"#)
            .await;

        let reply: Value = serde_json::from_str(&connector.sent_texts()[0]).unwrap();
        assert_eq!(reply["id"], 42);
        assert_eq!(reply["result"]["echo"], 7);
    }

    #[tokio::test]
    async fn unregistered_method_gets_method_not_found() {
        let connector = RecordingConnector::new();
        let rpc = RpcCorrelator::new(connector.clone());

        rpc.dispatch(r#"{"jsonrpc":"2.0","method":"nope","params":{},"id":9}"#)
            .await;

        let reply: Value = serde_json::from_str(&connector.sent_texts()[0]).unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notification_without_id_gets_no_reply() {
        let connector = RecordingConnector::new();
        let rpc = RpcCorrelator::new(connector.clone());

        rpc.dispatch(r#"{"jsonrpc":"2.0","method":"nope","params":{}}"#)
            .await;

        assert!(connector.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_dropped_without_panic() {
        let connector = RecordingConnector::new();
        let rpc = RpcCorrelator::new(connector.clone());
        rpc.dispatch("{{{{not json").await;
        assert!(connector.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn batch_routes_response_and_request() {
        let connector = RecordingConnector::new();
        let rpc = Arc::new(RpcCorrelator::new(connector.clone()));
        rpc.register_handler("notify", Arc::new(|_| Ok(Value::Null)));

        let rpc2 = Arc::clone(&rpc);
        let call =
            tokio::spawn(
                async move { rpc2.call("get", json!({}), Duration::from_secs(5)).await },
            );
        while connector.sent_texts().is_empty() {
            tokio::task::yield_now().await;
        }
        let sent: Value = serde_json::from_str(&connector.sent_texts()[0]).unwrap();
        let id = sent["id"].as_u64().unwrap();

        rpc.dispatch(&format!(
            r#"[{{"jsonrpc":"2.0","result":5,"id":{id}}},
                {{"jsonrpc":"2.0","method":"notify","params":{{}}}}]"#
        ))
        .await;

        assert_eq!(call.await.unwrap().unwrap(), json!(5));
    }
}
