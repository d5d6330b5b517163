//! Per-worker connection session: one WebSocket to one mesh.
//!
//! The session owns the socket for exactly one established connection.
//! Reconnecting means building a fresh session; the retry/backoff policy
//! lives in the worker runtime, not here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::config;
use crate::worker::MeshWorkerConfig;

/// Sub-protocol identifier expected by the mesh service.
pub const MESH_SUBPROTOCOL: &str = "mesh.v1";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("auth token is not a valid header value")]
    AuthHeader,

    #[error("session is not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Protocol state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Terminated,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Terminated => "terminated",
        }
    }
}

/// Events the session surfaces to its runtime.
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Disconnected { code: Option<u16>, reason: String },
    /// Inbound mesh traffic that is not a correlated response. Chat
    /// dispatch is an external collaborator; the runtime forwards or drops.
    Message(Value),
}

/// Everything needed to dial one mesh socket.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint: String,
    pub mesh_id: String,
    pub peer_id: String,
    pub device_id: String,
    pub auth_token: Option<String>,
    pub keepalive_interval: Duration,
    pub request_timeout: Duration,
    pub ping_failure_limit: u32,
    pub immediate_close_window: Duration,
}

impl SessionSettings {
    pub fn from_config(worker: &MeshWorkerConfig, session: &config::SessionConfig) -> Self {
        Self {
            endpoint: worker.endpoint.clone(),
            mesh_id: worker.mesh_id.clone(),
            peer_id: worker.peer_id.clone(),
            device_id: worker.device_id.clone(),
            auth_token: worker.auth_token.clone(),
            keepalive_interval: Duration::from_secs(session.keepalive_interval_secs),
            request_timeout: Duration::from_secs(session.request_timeout_secs),
            ping_failure_limit: session.ping_failure_limit,
            immediate_close_window: Duration::from_secs(session.immediate_close_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
    pub at: Instant,
}

enum RequestOutcome {
    Response(Value),
    ConnectionClosed,
}

/// Outstanding-request correlation table.
///
/// Request IDs come from a monotonic counter, so concurrent outstanding
/// requests can never collide.
pub struct PendingRequests {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<RequestOutcome>>>,
}

impl PendingRequests {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    fn resolve(&self, id: u64, value: Value) -> bool {
        match self.waiters.lock().unwrap().remove(&id) {
            Some(tx) => tx.send(RequestOutcome::Response(value)).is_ok(),
            None => false,
        }
    }

    fn forget(&self, id: u64) {
        self.waiters.lock().unwrap().remove(&id);
    }

    /// Reject every outstanding waiter with a connection-closed outcome.
    fn reject_all(&self) {
        let waiters: Vec<_> = {
            let mut map = self.waiters.lock().unwrap();
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(RequestOutcome::ConnectionClosed);
        }
    }

    fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

struct SessionShared {
    state: Mutex<SessionState>,
    /// Cleared before the socket closes so no send can race a teardown
    sendable: AtomicBool,
    disconnecting: AtomicBool,
    close_finished: AtomicBool,
    pending: PendingRequests,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    connected_at: Mutex<Option<Instant>>,
    last_close: Mutex<Option<CloseInfo>>,
}

/// One mesh WebSocket connection with keepalive and correlated requests.
pub struct ConnectionSession {
    settings: SessionSettings,
    shared: Arc<SessionShared>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl ConnectionSession {
    pub fn new(settings: SessionSettings) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let session = Self {
            settings,
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::Disconnected),
                sendable: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
                close_finished: AtomicBool::new(false),
                pending: PendingRequests::new(),
                sink: tokio::sync::Mutex::new(None),
                connected_at: Mutex::new(None),
                last_close: Mutex::new(None),
            }),
            events_tx,
        };
        (session, events_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn last_close(&self) -> Option<CloseInfo> {
        self.shared.last_close.lock().unwrap().clone()
    }

    /// True when the gap between connect-success and the last close was
    /// under the immediate-close window. The runtime treats that as a
    /// permanent rejection (bad auth, no access) and stops retrying.
    pub fn was_closed_immediately(&self) -> bool {
        let connected_at = *self.shared.connected_at.lock().unwrap();
        let last_close = self.shared.last_close.lock().unwrap();
        match (connected_at, last_close.as_ref()) {
            (Some(start), Some(close)) => {
                close.at.duration_since(start) < self.settings.immediate_close_window
            }
            _ => false,
        }
    }

    /// Dial the mesh socket. On success the reader and keepalive tasks are
    /// running, the connected event has fired, and the post-connect
    /// handshake request is in flight.
    pub async fn connect(&self) -> Result<(), SessionError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                SessionState::Disconnected => *state = SessionState::Connecting,
                SessionState::Terminated => return Err(SessionError::Closed),
                SessionState::Connecting | SessionState::Connected => return Ok(()),
            }
        }

        let request = build_request(&self.settings)?;
        let (ws, _response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.shared.state.lock().unwrap() = SessionState::Disconnected;
                return Err(e.into());
            }
        };

        let (sink, stream) = ws.split();
        *self.shared.sink.lock().await = Some(sink);
        *self.shared.connected_at.lock().unwrap() = Some(Instant::now());
        self.shared.sendable.store(true, Ordering::SeqCst);
        *self.shared.state.lock().unwrap() = SessionState::Connected;

        let _ = self.events_tx.send(SessionEvent::Connected).await;

        tokio::spawn(run_reader(
            Arc::clone(&self.shared),
            self.events_tx.clone(),
            stream,
        ));
        tokio::spawn(run_keepalive(
            Arc::clone(&self.shared),
            self.events_tx.clone(),
            self.settings.clone(),
        ));

        // Post-connect handshake, one shot; the outcome only matters to logs.
        let shared = Arc::clone(&self.shared);
        let settings = self.settings.clone();
        tokio::spawn(async move {
            let payload = serde_json::json!({
                "meshId": settings.mesh_id,
                "peerId": settings.peer_id,
                "deviceId": settings.device_id,
            });
            match request_on(&shared, &settings, "handshake", payload).await {
                Ok(Some(_)) => debug!(mesh_id = %settings.mesh_id, "Handshake acknowledged"),
                Ok(None) => warn!(mesh_id = %settings.mesh_id, "Handshake got no response"),
                Err(e) => debug!(mesh_id = %settings.mesh_id, error = %e, "Handshake not sent"),
            }
        });

        Ok(())
    }

    /// Send a correlated request; `Ok(None)` means no response arrived
    /// within the request timeout.
    pub async fn request(&self, op: &str, data: Value) -> Result<Option<Value>, SessionError> {
        request_on(&self.shared, &self.settings, op, data).await
    }

    /// Outstanding correlated requests, for status reporting.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Terminal teardown. Safe to call from multiple tasks concurrently;
    /// only the first call does any work.
    pub async fn disconnect(&self) {
        if self.shared.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        // Non-sendable first: nothing may write to a socket mid-teardown.
        self.shared.sendable.store(false, Ordering::SeqCst);
        *self.shared.state.lock().unwrap() = SessionState::Terminated;

        {
            let mut sink_guard = self.shared.sink.lock().await;
            if let Some(mut sink) = sink_guard.take() {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        }

        self.shared.pending.reject_all();

        let mut last_close = self.shared.last_close.lock().unwrap();
        if last_close.is_none() {
            *last_close = Some(CloseInfo {
                code: None,
                reason: "client disconnect".to_string(),
                at: Instant::now(),
            });
        }
    }
}

/// Build the upgrade request: mesh and peer identity in the query string,
/// fixed sub-protocol, and a bearer header only when a token is present —
/// an empty value triggers remote rejection.
fn build_request(
    settings: &SessionSettings,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SessionError> {
    let mut url = Url::parse(&settings.endpoint)?;
    url.query_pairs_mut()
        .append_pair("meshId", &settings.mesh_id)
        .append_pair("peerId", &settings.peer_id);

    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(MESH_SUBPROTOCOL));

    if let Some(token) = settings.auth_token.as_deref().filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| SessionError::AuthHeader)?;
        headers.insert(AUTHORIZATION, value);
    }

    Ok(request)
}

async fn send_frame(shared: &SessionShared, text: String) -> Result<(), SessionError> {
    if !shared.sendable.load(Ordering::SeqCst) {
        return Err(SessionError::NotConnected);
    }
    let mut sink_guard = shared.sink.lock().await;
    let sink = sink_guard.as_mut().ok_or(SessionError::NotConnected)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn request_on(
    shared: &SessionShared,
    settings: &SessionSettings,
    op: &str,
    data: Value,
) -> Result<Option<Value>, SessionError> {
    let (rid, rx) = shared.pending.register();
    let frame = serde_json::to_string(&serde_json::json!({
        "rid": rid,
        "op": op,
        "data": data,
    }))?;

    if let Err(e) = send_frame(shared, frame).await {
        shared.pending.forget(rid);
        return Err(e);
    }

    match tokio::time::timeout(settings.request_timeout, rx).await {
        Ok(Ok(RequestOutcome::Response(value))) => Ok(Some(value)),
        Ok(Ok(RequestOutcome::ConnectionClosed)) => Err(SessionError::Closed),
        Ok(Err(_)) => Err(SessionError::Closed),
        Err(_) => {
            // Timed out: drop the waiter so the table cannot grow unbounded
            shared.pending.forget(rid);
            Ok(None)
        }
    }
}

/// Inbound reader: resolves correlated responses, surfaces everything else,
/// and reports the close when the transport ends.
async fn run_reader(
    shared: Arc<SessionShared>,
    events: mpsc::Sender<SessionEvent>,
    mut stream: SplitStream<WsStream>,
) {
    let mut close: Option<CloseInfo> = None;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(text.as_str()) {
                Ok(value) => {
                    let rid = value.get("rid").and_then(|v| v.as_u64());
                    let resolved = rid.map(|rid| shared.pending.resolve(rid, value.clone()));
                    if resolved != Some(true) {
                        let _ = events.send(SessionEvent::Message(value)).await;
                    }
                }
                Err(_) => debug!("Ignoring non-JSON mesh frame"),
            },
            Ok(Message::Close(frame)) => {
                close = Some(match frame {
                    Some(f) => CloseInfo {
                        code: Some(u16::from(f.code)),
                        reason: f.reason.to_string(),
                        at: Instant::now(),
                    },
                    None => CloseInfo {
                        code: None,
                        reason: String::new(),
                        at: Instant::now(),
                    },
                });
                break;
            }
            Ok(_) => {} // binary and ping/pong frames handled by the transport
            Err(e) => {
                close = Some(CloseInfo {
                    code: None,
                    reason: e.to_string(),
                    at: Instant::now(),
                });
                break;
            }
        }
    }

    let close = close.unwrap_or_else(|| CloseInfo {
        code: None,
        reason: "stream ended".to_string(),
        at: Instant::now(),
    });
    finish_close(&shared, &events, close).await;
}

/// Keepalive: first ping only after one full interval, then every tick.
/// A lone failure is logged; consecutive failures past the limit force a
/// close so the runtime's reconnect path takes over.
async fn run_keepalive(
    shared: Arc<SessionShared>,
    events: mpsc::Sender<SessionEvent>,
    settings: SessionSettings,
) {
    let period = settings.keepalive_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut failures: u32 = 0;

    loop {
        ticker.tick().await;
        if !shared.sendable.load(Ordering::SeqCst) {
            break;
        }

        match request_on(&shared, &settings, "ping", Value::Null).await {
            Ok(Some(_)) => failures = 0,
            Ok(None) => {
                failures += 1;
                warn!(
                    mesh_id = %settings.mesh_id,
                    failures,
                    limit = settings.ping_failure_limit,
                    "Keepalive ping got no response"
                );
            }
            Err(_) => break,
        }

        if failures >= settings.ping_failure_limit {
            warn!(mesh_id = %settings.mesh_id, "Keepalive failures exhausted; forcing close");
            force_close(&shared, &events, "keepalive timeout").await;
            break;
        }
    }
}

/// Close the socket without terminating the session object: the state goes
/// back to `Disconnected` so the runtime can rebuild the connection.
async fn force_close(shared: &Arc<SessionShared>, events: &mpsc::Sender<SessionEvent>, reason: &str) {
    shared.sendable.store(false, Ordering::SeqCst);
    {
        let mut sink_guard = shared.sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            let _ = sink.close().await;
        }
    }
    finish_close(
        shared,
        events,
        CloseInfo {
            code: None,
            reason: reason.to_string(),
            at: Instant::now(),
        },
    )
    .await;
}

async fn finish_close(shared: &Arc<SessionShared>, events: &mpsc::Sender<SessionEvent>, close: CloseInfo) {
    if shared.close_finished.swap(true, Ordering::SeqCst) {
        return;
    }

    shared.sendable.store(false, Ordering::SeqCst);
    {
        let mut state = shared.state.lock().unwrap();
        if *state != SessionState::Terminated {
            *state = SessionState::Disconnected;
        }
    }
    *shared.last_close.lock().unwrap() = Some(close.clone());
    shared.pending.reject_all();

    let _ = events
        .send(SessionEvent::Disconnected {
            code: close.code,
            reason: close.reason,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SessionSettings {
        SessionSettings {
            endpoint: "wss://mesh.example.com/ws".to_string(),
            mesh_id: "abc".to_string(),
            peer_id: "bot-1".to_string(),
            device_id: "host-1".to_string(),
            auth_token: Some("secret".to_string()),
            keepalive_interval: Duration::from_secs(6),
            request_timeout: Duration::from_secs(8),
            ping_failure_limit: 3,
            immediate_close_window: Duration::from_secs(5),
        }
    }

    #[test]
    fn request_carries_identity_and_subprotocol() {
        let request = build_request(&settings()).unwrap();
        let uri = request.uri().to_string();
        assert!(uri.contains("meshId=abc"));
        assert!(uri.contains("peerId=bot-1"));
        assert_eq!(
            request.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            MESH_SUBPROTOCOL
        );
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer secret"
        );
    }

    #[test]
    fn empty_token_sends_no_auth_header() {
        let mut s = settings();
        s.auth_token = Some(String::new());
        let request = build_request(&s).unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());

        let mut s = settings();
        s.auth_token = None;
        let request = build_request(&s).unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn request_ids_are_monotonic_and_unique() {
        let pending = PendingRequests::new();
        let (a, _rx_a) = pending.register();
        let (b, _rx_b) = pending.register();
        let (c, _rx_c) = pending.register();
        assert!(a < b && b < c);
        assert_eq!(pending.len(), 3);
    }

    #[test]
    fn resolving_unknown_id_is_a_noop() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve(999, Value::Null));
    }

    #[tokio::test]
    async fn reject_all_fails_outstanding_waiters() {
        let pending = PendingRequests::new();
        let (_id, rx) = pending.register();
        pending.reject_all();
        match rx.await {
            Ok(RequestOutcome::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {:?}", other.is_ok()),
        }
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn new_session_starts_disconnected() {
        let (session, _events) = ConnectionSession::new(settings());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.was_closed_immediately());
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_terminal() {
        let (session, _events) = ConnectionSession::new(settings());
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.connect().await.is_err());
    }

    #[tokio::test]
    async fn immediate_close_window_is_honored() {
        let (session, _events) = ConnectionSession::new(settings());
        *session.shared.connected_at.lock().unwrap() = Some(Instant::now());
        *session.shared.last_close.lock().unwrap() = Some(CloseInfo {
            code: Some(4003),
            reason: "unauthorized".to_string(),
            at: Instant::now(),
        });
        assert!(session.was_closed_immediately());

        // A close that lands after the window is not "immediate"
        *session.shared.connected_at.lock().unwrap() =
            Instant::now().checked_sub(Duration::from_secs(60));
        assert!(!session.was_closed_immediately());
    }
}
