//! Long-polling connector over `reqwest`.
//!
//! One outstanding GET at a time. The client-side timeout is kept below
//! any server-side idle window, so an elapsed request just means an idle
//! cycle and the poll is reissued; a "not modified" response likewise
//! proves the link alive without carrying data. Only transport-level
//! failures are reported upward, where the orchestrator reschedules.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use pulse_core::PulseError;
use pulse_core::constants::LONG_POLL_TIMEOUT_SECS;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::connector::{Connector, Payload, TransportEvent};

/// Long-poll transport.
pub struct LongPollConnector {
    poll_url: Arc<RwLock<Url>>,
    publish_url: RwLock<Url>,
    client: reqwest::Client,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
    request_timeout: Duration,
}

impl LongPollConnector {
    /// Create a connector polling `poll_url` and publishing to
    /// `publish_url`, reporting on `events`.
    pub fn new(poll_url: Url, publish_url: Url, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            poll_url: Arc::new(RwLock::new(poll_url)),
            publish_url: RwLock::new(publish_url),
            client: reqwest::Client::new(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            request_timeout: Duration::from_secs(LONG_POLL_TIMEOUT_SECS),
        }
    }

    /// Replace the poll URL picked up by the next cycle (resume
    /// parameters advance as messages arrive).
    pub fn set_url(&self, url: Url) {
        *self.poll_url.write() = url;
    }

    /// Override the per-request timeout (tests poll fast servers).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for LongPollConnector {
    async fn connect(&self) -> Result<(), PulseError> {
        if self.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());
        self.connected.store(true, Ordering::Relaxed);
        let _ = self.events.send(TransportEvent::Connected).await;

        drop(tokio::spawn(poll_loop(
            self.client.clone(),
            Arc::clone(&self.poll_url),
            self.request_timeout,
            self.events.clone(),
            Arc::clone(&self.connected),
            cancel,
        )));
        Ok(())
    }

    async fn disconnect(&self, code: u16, reason: &str) {
        debug!(code, reason, "long-poll disconnect");
        self.connected.store(false, Ordering::Relaxed);
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }

    async fn send(&self, payload: Payload) -> bool {
        if !self.connected.load(Ordering::Relaxed) {
            return false;
        }
        let url = self.publish_url.read().clone();
        let request = match payload {
            Payload::Text(text) => self.client.post(url).body(text),
            Payload::Binary(bytes) => self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        };
        match request.timeout(self.request_timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                warn!(%err, "long-poll publish failed");
                false
            }
        }
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

async fn poll_loop(
    client: reqwest::Client,
    url: Arc<RwLock<Url>>,
    timeout: Duration,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let lost: Option<(u16, String)> = loop {
        let target = url.read().clone();
        let request = client.get(target).timeout(timeout).send();
        let response = tokio::select! {
            () = cancel.cancelled() => break None,
            response = request => response,
        };
        match response {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_MODIFIED => {
                // Cache-valid: link alive, no new data.
            }
            Ok(resp) if resp.status().is_success() => {
                // Binary-mode bodies arrive as octet streams; everything
                // else is sentinel-framed text.
                let binary = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .is_some_and(|ct| ct.starts_with("application/octet-stream"));
                if binary {
                    match resp.bytes().await {
                        Ok(body) if body.is_empty() => {}
                        Ok(body) => {
                            let _ = events
                                .send(TransportEvent::Message(Payload::Binary(body.to_vec())))
                                .await;
                        }
                        Err(err) => break Some((1006, format!("read body: {err}"))),
                    }
                } else {
                    match resp.text().await {
                        Ok(body) if body.is_empty() => {}
                        Ok(body) => {
                            let _ = events
                                .send(TransportEvent::Message(Payload::Text(body)))
                                .await;
                        }
                        Err(err) => break Some((1006, format!("read body: {err}"))),
                    }
                }
            }
            Ok(resp) => break Some((resp.status().as_u16(), "unexpected status".into())),
            Err(err) if err.is_timeout() => {
                // Idle cycle: the client gives up before the server's own
                // idle window and simply reissues.
            }
            Err(err) => break Some((1006, err.to_string())),
        }
    };

    connected.store(false, Ordering::Relaxed);
    if let Some((code, reason)) = lost {
        let _ = events
            .send(TransportEvent::Disconnected { code, reason })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn urls(server: &MockServer) -> (Url, Url) {
        let poll = Url::parse(&format!("{}/sub", server.uri())).unwrap();
        let publish = Url::parse(&format!("{}/pub", server.uri())).unwrap();
        (poll, publish)
    }

    async fn next_message(rx: &mut mpsc::Receiver<TransportEvent>) -> Payload {
        loop {
            match rx.recv().await.expect("event stream ended") {
                TransportEvent::Message(payload) => return payload,
                TransportEvent::Connected => {}
                TransportEvent::Disconnected { code, reason } => {
                    panic!("unexpected disconnect {code}: {reason}")
                }
            }
        }
    }

    #[tokio::test]
    async fn delivers_poll_body_as_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#!NGINXNMS!#{}#!NGINXNME!#"))
            .mount(&server)
            .await;

        let (poll, publish) = urls(&server);
        let (tx, mut rx) = mpsc::channel(16);
        let conn = LongPollConnector::new(poll, publish, tx)
            .with_request_timeout(Duration::from_secs(2));
        conn.connect().await.unwrap();

        let payload = next_message(&mut rx).await;
        assert_eq!(payload, Payload::Text("#!NGINXNMS!#{}#!NGINXNME!#".into()));
        conn.disconnect(1000, "done").await;
    }

    #[tokio::test]
    async fn octet_stream_body_is_delivered_as_binary() {
        use prost::Message as _;
        use pulse_wire::binary;

        let batch = binary::ResponseBatch {
            responses: vec![binary::Response {
                outgoing_messages: Some(binary::OutgoingMessagesResponse {
                    messages: vec![binary::OutgoingMessage {
                        id: "m1".into(),
                        sender: None,
                        body: r#"{"module_id":"im","command":"x"}"#.into(),
                    }],
                }),
            }],
        };
        let body = batch.encode_to_vec();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body.clone(), "application/octet-stream"),
            )
            .mount(&server)
            .await;

        let (poll, publish) = urls(&server);
        let (tx, mut rx) = mpsc::channel(16);
        let conn = LongPollConnector::new(poll, publish, tx)
            .with_request_timeout(Duration::from_secs(2));
        conn.connect().await.unwrap();

        // Bytes survive untouched and decode back to the same batch.
        let payload = next_message(&mut rx).await;
        assert_eq!(payload, Payload::Binary(body));
        let Payload::Binary(bytes) = payload else {
            unreachable!()
        };
        assert_eq!(binary::decode_response_batch(&bytes).unwrap(), batch);
        conn.disconnect(1000, "done").await;
    }

    #[tokio::test]
    async fn not_modified_keeps_link_alive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(304))
            .expect(2..)
            .mount(&server)
            .await;

        let (poll, publish) = urls(&server);
        let (tx, mut rx) = mpsc::channel(16);
        let conn = LongPollConnector::new(poll, publish, tx)
            .with_request_timeout(Duration::from_secs(2));
        conn.connect().await.unwrap();

        // Connected, then silence: no Disconnected while 304s cycle.
        assert!(matches!(rx.recv().await, Some(TransportEvent::Connected)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert!(conn.connected());
        conn.disconnect(1000, "done").await;
    }

    #[tokio::test]
    async fn server_error_reports_disconnect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let (poll, publish) = urls(&server);
        let (tx, mut rx) = mpsc::channel(16);
        let conn = LongPollConnector::new(poll, publish, tx)
            .with_request_timeout(Duration::from_secs(2));
        conn.connect().await.unwrap();

        assert!(matches!(rx.recv().await, Some(TransportEvent::Connected)));
        match rx.recv().await {
            Some(TransportEvent::Disconnected { code, .. }) => assert_eq!(code, 502),
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(!conn.connected());
    }

    #[tokio::test]
    async fn publish_posts_to_publish_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/pub"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (poll, publish) = urls(&server);
        let (tx, _rx) = mpsc::channel(16);
        let conn = LongPollConnector::new(poll, publish, tx)
            .with_request_timeout(Duration::from_secs(2));
        conn.connect().await.unwrap();

        assert!(conn.send(Payload::Binary(vec![1, 2, 3])).await);
        conn.disconnect(1000, "done").await;
    }

    #[tokio::test]
    async fn send_while_disconnected_is_refused() {
        let (tx, _rx) = mpsc::channel(16);
        let conn = LongPollConnector::new(
            Url::parse("http://127.0.0.1:1/sub").unwrap(),
            Url::parse("http://127.0.0.1:1/pub").unwrap(),
            tx,
        );
        assert!(!conn.send(Payload::Text("x".into())).await);
    }
}
