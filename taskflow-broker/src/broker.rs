//! Broker core: shared state, WebSocket handler, subscription registry, and
//! fan-out.
//!
//! Each connection performs the STOMP handshake, then issues SUBSCRIBE,
//! UNSUBSCRIBE, SEND and DISCONNECT frames. A SEND (or a server-side
//! [`BrokerState::publish`]) is delivered as a MESSAGE to every live
//! subscription on the destination.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use taskflow_proto::stomp::{self, Command, Frame, HeartBeat};
use tokio::sync::{RwLock, mpsc};

/// Default maximum SEND body size in bytes (64 KB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Identifies one WebSocket connection.
pub type SessionId = u64;

/// One subscription as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SubscriberEntry {
    session: SessionId,
    subscription_id: String,
}

/// Shared broker state.
pub struct BrokerState {
    /// Session id to the channel feeding that connection's writer task.
    sessions: RwLock<HashMap<SessionId, mpsc::UnboundedSender<Message>>>,
    /// Destination to its live subscriptions.
    subscriptions: RwLock<HashMap<String, Vec<SubscriberEntry>>>,
    /// Authorization header of the most recent CONNECT, for inspection.
    last_authorization: RwLock<Option<String>>,
    next_session: AtomicU64,
    next_message: AtomicU64,
    /// What the broker offers in its CONNECTED heart-beat header.
    heart_beat: HeartBeat,
    /// SEND bodies larger than this are refused with an ERROR frame.
    max_payload_size: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    /// Broker state with heart-beats disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::with_heart_beat(HeartBeat::default())
    }

    /// Broker state offering the given heart-beat intervals.
    #[must_use]
    pub fn with_heart_beat(heart_beat: HeartBeat) -> Self {
        Self::with_config(heart_beat, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Broker state with explicit heart-beat and payload limits.
    #[must_use]
    pub fn with_config(heart_beat: HeartBeat, max_payload_size: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            last_authorization: RwLock::new(None),
            next_session: AtomicU64::new(1),
            next_message: AtomicU64::new(1),
            heart_beat,
            max_payload_size,
        }
    }

    /// Deliver `body` to every subscription on `destination`.
    ///
    /// Returns how many subscriptions the message was queued for.
    pub async fn publish(&self, destination: &str, body: &[u8]) -> usize {
        let targets = {
            let subs = self.subscriptions.read().await;
            subs.get(destination).cloned().unwrap_or_default()
        };
        if targets.is_empty() {
            tracing::debug!(destination, "publish with no subscribers");
            return 0;
        }

        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for entry in targets {
            let Some(tx) = sessions.get(&entry.session) else {
                continue;
            };
            let message_id = self.next_message.fetch_add(1, Ordering::Relaxed);
            let frame = Frame::new(Command::Message)
                .header("destination", destination)
                .header("subscription", entry.subscription_id.as_str())
                .header("message-id", message_id.to_string())
                .header("content-type", "application/json")
                .with_body(body.to_vec());
            if tx.send(to_ws_message(&frame)).is_ok() {
                delivered += 1;
            }
        }
        drop(sessions);
        tracing::debug!(destination, delivered, "published message");
        delivered
    }

    /// Number of live subscriptions on `destination`.
    pub async fn subscriber_count(&self, destination: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(destination)
            .map_or(0, Vec::len)
    }

    /// Number of connected sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// `Authorization` header sent with the most recent CONNECT.
    pub async fn last_authorization(&self) -> Option<String> {
        self.last_authorization.read().await.clone()
    }

    /// Close every connection, as a broker restart would.
    pub async fn close_all_connections(&self) {
        let sessions = self.sessions.read().await;
        for (session, tx) in sessions.iter() {
            tracing::info!(session, "closing session");
            let _ = tx.send(Message::Close(None));
        }
    }

    async fn register(&self, tx: mpsc::UnboundedSender<Message>) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().await.insert(id, tx);
        id
    }

    async fn unregister(&self, session: SessionId) {
        self.sessions.write().await.remove(&session);
        let mut subs = self.subscriptions.write().await;
        for entries in subs.values_mut() {
            entries.retain(|e| e.session != session);
        }
        subs.retain(|_, entries| !entries.is_empty());
    }

    async fn subscribe(&self, session: SessionId, subscription_id: &str, destination: &str) {
        let mut subs = self.subscriptions.write().await;
        let entries = subs.entry(destination.to_string()).or_default();
        let entry = SubscriberEntry {
            session,
            subscription_id: subscription_id.to_string(),
        };
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    async fn unsubscribe(&self, session: SessionId, subscription_id: &str) {
        let mut subs = self.subscriptions.write().await;
        for entries in subs.values_mut() {
            entries.retain(|e| !(e.session == session && e.subscription_id == subscription_id));
        }
        subs.retain(|_, entries| !entries.is_empty());
    }
}

/// Encode a frame as a WebSocket message, text when the bytes are UTF-8.
fn to_ws_message(frame: &Frame) -> Message {
    match String::from_utf8(stomp::encode(frame)) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}

/// Decode the frames carried by a WebSocket message. Control frames yield
/// nothing; malformed data is logged and dropped.
fn frames_of(session: Option<SessionId>, msg: &Message) -> Vec<Frame> {
    let bytes: &[u8] = match msg {
        Message::Text(text) => text.as_str().as_bytes(),
        Message::Binary(data) => data.as_ref(),
        _ => return Vec::new(),
    };
    match stomp::decode(bytes) {
        Ok(frames) => frames,
        Err(e) => {
            tracing::warn!(?session, error = %e, "malformed frame, dropping");
            Vec::new()
        }
    }
}

/// Handles an upgraded WebSocket connection.
///
/// 1. Wait for CONNECT (or STOMP) and answer CONNECTED.
/// 2. Register the session and spawn its writer task.
/// 3. Process client frames until DISCONNECT or close.
/// 4. Unregister the session and drop its subscriptions.
pub async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(connect) = wait_for_connect(&mut ws_receiver).await else {
        tracing::warn!("connection closed before STOMP handshake");
        return;
    };

    if let Some(auth) = connect.get("Authorization") {
        *state.last_authorization.write().await = Some(auth.to_string());
    }

    let client_hb = connect
        .get("heart-beat")
        .map(HeartBeat::parse)
        .unwrap_or_default();
    let (send_every, _) = HeartBeat::negotiate(state.heart_beat, client_hb);

    let connected = Frame::new(Command::Connected)
        .header("version", "1.2")
        .header("heart-beat", state.heart_beat.to_string());
    if ws_sender.send(to_ws_message(&connected)).await.is_err() {
        tracing::warn!("failed to send CONNECTED");
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let session = state.register(tx.clone()).await;
    tracing::info!(session, "session connected");

    let mut write_task = tokio::spawn(writer_loop(ws_sender, rx, send_every, session));

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                tracing::info!(session, "received close frame");
                break;
            }
            for frame in frames_of(Some(session), &msg) {
                if !handle_frame(session, frame, &reader_state, &tx).await {
                    return;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            // Let the writer flush a pending RECEIPT before closing.
            tokio::time::sleep(Duration::from_millis(20)).await;
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(session).await;
    tracing::info!(session, "session closed");
}

/// Forward queued messages to the socket, interleaving heart-beats.
async fn writer_loop(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    heart_beat: Option<Duration>,
    session: SessionId,
) {
    let mut ticker = heart_beat.map(tokio::time::interval);
    loop {
        let msg = if let Some(ticker) = ticker.as_mut() {
            tokio::select! {
                msg = rx.recv() => msg,
                _ = ticker.tick() => Some(Message::Text("\n".into())),
            }
        } else {
            rx.recv().await
        };
        let Some(msg) = msg else { break };
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() {
            tracing::warn!(session, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

/// Apply one client frame. Returns `false` when the session should end.
async fn handle_frame(
    session: SessionId,
    frame: Frame,
    state: &Arc<BrokerState>,
    tx: &mpsc::UnboundedSender<Message>,
) -> bool {
    match frame.command {
        Command::Subscribe => {
            let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination")) else {
                send_error(tx, "SUBSCRIBE requires id and destination");
                return true;
            };
            tracing::debug!(session, id, destination, "subscribe");
            state.subscribe(session, id, destination).await;
        }
        Command::Unsubscribe => {
            if let Some(id) = frame.get("id") {
                tracing::debug!(session, id, "unsubscribe");
                state.unsubscribe(session, id).await;
            } else {
                send_error(tx, "UNSUBSCRIBE requires id");
            }
        }
        Command::Send => {
            let Some(destination) = frame.get("destination") else {
                send_error(tx, "SEND requires destination");
                return true;
            };
            if frame.body.len() > state.max_payload_size {
                tracing::warn!(
                    session,
                    size = frame.body.len(),
                    max = state.max_payload_size,
                    "SEND body too large"
                );
                send_error(tx, "payload too large");
                return true;
            }
            state.publish(destination, &frame.body).await;
        }
        Command::Disconnect => {
            if let Some(receipt) = frame.get("receipt") {
                let reply = Frame::new(Command::Receipt).header("receipt-id", receipt);
                let _ = tx.send(to_ws_message(&reply));
            }
            tracing::info!(session, "client disconnected");
            return false;
        }
        Command::Ack | Command::Nack | Command::Begin | Command::Commit | Command::Abort => {
            tracing::debug!(session, command = %frame.command, "ignoring frame");
        }
        other => {
            tracing::warn!(session, command = %other, "unexpected client frame");
            send_error(tx, &format!("unexpected frame {other}"));
        }
    }
    true
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, message: &str) {
    let frame = Frame::new(Command::Error)
        .header("message", message)
        .with_body(message.as_bytes().to_vec());
    let _ = tx.send(to_ws_message(&frame));
}

/// Wait for the handshake frame. Heart-beats before it are skipped.
async fn wait_for_connect(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Frame> {
    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            return None;
        }
        let mut frames = frames_of(None, &msg).into_iter();
        match frames.next() {
            Some(frame) if matches!(frame.command, Command::Connect | Command::Stomp) => {
                return Some(frame);
            }
            Some(other) => {
                tracing::warn!(command = %other.command, "expected CONNECT");
                return None;
            }
            None => {}
        }
    }
    None
}

/// Starts the broker on `addr` with default state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BrokerState::new())).await
}

/// Starts the broker with a pre-built [`BrokerState`].
///
/// The STOMP endpoint is served on `/ws` and on `/ws/websocket`, the raw
/// WebSocket path SockJS-style servers expose.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BrokerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/ws/websocket", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BrokerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
