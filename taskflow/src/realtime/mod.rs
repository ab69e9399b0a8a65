//! Real-time change notifications over STOMP on a WebSocket.
//!
//! [`RealtimeBridge`] owns one logical broker connection. A supervisor task
//! opens the socket, performs the STOMP handshake and runs the session; when
//! the transport drops it waits `reconnect_delay` and tries again until
//! [`RealtimeBridge::disconnect`] is called.
//!
//! Subscriptions do not survive a transport loss. The `on_ready` callback
//! given to [`RealtimeBridge::connect`] runs after every successful
//! handshake and is where callers (re)subscribe.

mod connection;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use taskflow_proto::stomp::{Frame, HeartBeat, StompError};
use taskflow_proto::topic::Topic;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use registry::SubscriptionHandle;

use registry::Registry;

use crate::session::TokenStore;

/// A message delivered to subscription handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeMessage {
    /// Topic the message arrived on.
    pub topic: Topic,
    /// Parsed body. A body that is not JSON arrives as a JSON string.
    pub body: serde_json::Value,
}

/// Callback invoked for every message on a subscribed topic.
pub type Handler = Arc<dyn Fn(&RealtimeMessage) + Send + Sync>;

/// Callback invoked after each successful handshake.
pub type OnReady = Arc<dyn Fn() + Send + Sync>;

/// Errors ending one connection attempt or session. The supervisor logs
/// them and reconnects; they never reach subscription handlers.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The WebSocket could not be opened.
    #[error("websocket connect to {url} failed: {message}")]
    Connect {
        /// Endpoint.
        url: String,
        /// Underlying failure.
        message: String,
    },
    /// Socket open or STOMP handshake took longer than `connect_timeout`.
    #[error("connect timed out")]
    Timeout,
    /// The broker answered CONNECT with ERROR.
    #[error("broker rejected connection: {0}")]
    Rejected(String),
    /// The broker sent ERROR on an established session.
    #[error("broker error: {0}")]
    Broker(String),
    /// A frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] StompError),
    /// No frame or heart-beat arrived within the negotiated window.
    #[error("no heart-beat from broker within {0:?}")]
    HeartbeatTimeout(Duration),
    /// The socket closed or failed.
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// First attempt in progress.
    Connecting,
    /// Handshake completed; subscriptions accepted.
    Connected,
    /// Waiting to retry after a failure or drop.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
}

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/ws/websocket`.
    pub url: String,
    /// Limit for socket open and STOMP handshake together.
    pub connect_timeout: Duration,
    /// Fixed wait between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Heart-beat offer sent in CONNECT.
    pub heart_beat: HeartBeat,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: crate::config::DEFAULT_WS_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(5000),
            heart_beat: HeartBeat::new(4000, 4000),
        }
    }
}

impl RealtimeConfig {
    /// Defaults with a different endpoint.
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Registry and outbound queue, guarded together so a subscription can
/// never be recorded against a session that is already gone.
#[derive(Default)]
struct Link {
    registry: Registry,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

impl Link {
    fn send(&self, frame: Frame) {
        if let Some(tx) = &self.outbound
            && tx.send(frame).is_err()
        {
            tracing::debug!("session gone, frame dropped");
        }
    }
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct Shared {
    config: RealtimeConfig,
    tokens: Arc<TokenStore>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|s| {
            let changed = *s != state;
            *s = state;
            changed
        });
    }

    /// Install the outbound queue of a fresh session.
    fn attach(&self, tx: mpsc::UnboundedSender<Frame>) {
        let mut link = self.link.lock();
        link.registry.clear();
        link.outbound = Some(tx);
    }

    /// Forget the session and every subscription made on it.
    fn detach(&self) {
        let mut link = self.link.lock();
        link.outbound = None;
        link.registry.clear();
    }

    fn dispatch(&self, frame: &Frame) {
        let routed = self
            .link
            .lock()
            .registry
            .route(frame.get("subscription"), frame.get("destination"));
        let Some((topic, handlers)) = routed else {
            tracing::debug!(destination = ?frame.get("destination"), "message for unknown subscription");
            return;
        };
        let Some(body) = parse_body(&frame.body_text()) else {
            tracing::warn!(%topic, "malformed message body, skipping");
            return;
        };
        let message = RealtimeMessage { topic, body };
        for handler in handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&message)));
            if outcome.is_err() {
                tracing::warn!(topic = %message.topic, "subscription handler panicked");
            }
        }
    }
}

/// Parse a message body. Plain-text notifications (the server sends
/// `updated` on comment topics) become JSON strings; text that looks like
/// JSON but does not parse is rejected.
fn parse_body(text: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(text) {
        Ok(v) => Some(v),
        Err(e) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with(['{', '[', '"']) {
                tracing::debug!(err = %e, "body is not valid JSON");
                None
            } else {
                Some(serde_json::Value::String(text.to_string()))
            }
        }
    }
}

/// Handle to the shared broker connection. Cheap to clone.
#[derive(Clone)]
pub struct RealtimeBridge {
    shared: Arc<Shared>,
    supervisor: Arc<Mutex<Option<Supervisor>>>,
}

impl std::fmt::Debug for RealtimeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeBridge")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RealtimeBridge {
    /// A disconnected bridge. Nothing happens until [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: RealtimeConfig, tokens: Arc<TokenStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                tokens,
                state: watch::channel(ConnectionState::Disconnected).0,
                link: Mutex::new(Link::default()),
            }),
            supervisor: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the connection if it is not already running. `on_ready` runs
    /// after every successful handshake, including reconnects. Calling this
    /// again while running is a no-op and keeps the first `on_ready`.
    pub fn connect(&self, on_ready: impl Fn() + Send + Sync + 'static) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|s| !s.task.is_finished()) {
            tracing::debug!("realtime bridge already running");
            return;
        }
        let cancel = CancellationToken::new();
        let on_ready: OnReady = Arc::new(on_ready);
        let task = tokio::spawn(connection::supervise(
            Arc::clone(&self.shared),
            on_ready,
            cancel.clone(),
        ));
        *supervisor = Some(Supervisor { cancel, task });
    }

    /// Register `handler` for `topic`. Returns `None` and logs a warning
    /// when not connected.
    pub fn subscribe(&self, topic: &Topic, handler: Handler) -> Option<SubscriptionHandle> {
        let mut link = self.shared.link.lock();
        if link.outbound.is_none() {
            tracing::warn!(%topic, "cannot subscribe, not connected");
            return None;
        }
        let (handle, frame) = link.registry.add(topic, handler);
        if let Some(frame) = frame {
            tracing::debug!(%topic, "subscribing");
            link.send(frame);
        }
        Some(handle)
    }

    /// Release one registration. Unknown or stale handles are ignored.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut link = self.shared.link.lock();
        if let Some(frame) = link.registry.remove(handle) {
            tracing::debug!(topic = %handle.topic(), "unsubscribing");
            link.send(frame);
        }
    }

    /// Release every registration on `topic`.
    pub fn unsubscribe_topic(&self, topic: &Topic) {
        let mut link = self.shared.link.lock();
        if let Some(frame) = link.registry.remove_topic(topic) {
            tracing::debug!(%topic, "unsubscribing topic");
            link.send(frame);
        }
    }

    /// Whether `handle` is still registered on the current session.
    #[must_use]
    pub fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        self.shared.link.lock().registry.contains(handle)
    }

    /// Number of local handlers on `topic`.
    #[must_use]
    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.shared.link.lock().registry.handler_count(topic)
    }

    /// Stop reconnecting, close the socket, drop every subscription.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(Supervisor { cancel, task }) = supervisor {
            cancel.cancel();
            if let Err(e) = task.await {
                tracing::warn!(err = %e, "realtime supervisor ended abnormally");
            }
        }
        self.shared.detach();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Current connection status.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Follow connection status changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the handshake has completed on the current socket.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
