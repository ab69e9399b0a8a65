// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the STOMP real-time bridge.
//!
//! Each test starts the in-process `taskflow-broker` on an ephemeral port and
//! points a [`RealtimeBridge`] at it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use taskflow::realtime::{ConnectionState, Handler, RealtimeBridge, RealtimeConfig, RealtimeMessage};
use taskflow::session::TokenStore;
use taskflow_broker::broker::{self, BrokerState};
use taskflow_proto::topic::Topic;
use tokio::sync::mpsc;

// =============================================================================
// Helpers
// =============================================================================

async fn start_broker() -> (String, Arc<BrokerState>) {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = broker::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws/websocket"), state)
}

fn bridge_for(url: &str) -> (RealtimeBridge, Arc<TokenStore>) {
    let tokens = Arc::new(TokenStore::in_memory());
    tokens.set_credentials("a1", "r1", "alice");
    let config = RealtimeConfig {
        reconnect_delay: Duration::from_millis(100),
        ..RealtimeConfig::with_url(url)
    };
    (RealtimeBridge::new(config, Arc::clone(&tokens)), tokens)
}

/// A handler that forwards every message into a channel.
fn collector() -> (Handler, mpsc::UnboundedReceiver<RealtimeMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Handler = Arc::new(move |msg: &RealtimeMessage| {
        let _ = tx.send(msg.clone());
    });
    (handler, rx)
}

/// Poll `check` until it holds, failing after two seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_connected(bridge: &RealtimeBridge) {
    let mut state = bridge.watch_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("bridge did not connect")
    .unwrap();
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<RealtimeMessage>) -> RealtimeMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message delivered")
        .unwrap()
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn handshake_carries_bearer_token_and_runs_on_ready() {
    let (url, broker) = start_broker().await;
    let (bridge, _tokens) = bridge_for(&url);
    let ready = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ready);
    bridge.connect(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    wait_connected(&bridge).await;

    assert!(bridge.is_connected());
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert_eq!(broker.last_authorization().await.as_deref(), Some("Bearer a1"));
    assert_eq!(broker.session_count().await, 1);

    // A second connect while running is a no-op.
    bridge.connect(|| {});
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.session_count().await, 1);

    bridge.disconnect().await;
}

#[tokio::test]
async fn subscribe_before_connect_is_refused() {
    let (url, _broker) = start_broker().await;
    let (bridge, _tokens) = bridge_for(&url);
    let (handler, _rx) = collector();

    assert_eq!(bridge.state(), ConnectionState::Disconnected);
    assert!(bridge.subscribe(&Topic::Tasks, handler).is_none());
}

#[tokio::test]
async fn disconnect_closes_the_session() {
    let (url, broker) = start_broker().await;
    let (bridge, _tokens) = bridge_for(&url);
    bridge.connect(|| {});
    wait_connected(&bridge).await;

    let (handler, _rx) = collector();
    let handle = bridge.subscribe(&Topic::Tasks, handler.clone()).unwrap();
    eventually("subscription", || async {
        broker.subscriber_count("/topic/tasks").await == 1
    })
    .await;

    bridge.disconnect().await;
    assert_eq!(bridge.state(), ConnectionState::Disconnected);
    assert!(!bridge.is_active(&handle));
    assert!(bridge.subscribe(&Topic::Tasks, handler).is_none());
    eventually("session to close", || async { broker.session_count().await == 0 }).await;
    assert_eq!(broker.subscriber_count("/topic/tasks").await, 0);
}

#[tokio::test]
async fn unreachable_broker_keeps_retrying_until_disconnect() {
    let (bridge, _tokens) = bridge_for("ws://127.0.0.1:9/ws");
    bridge.connect(|| {});

    let mut state = bridge.watch_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ConnectionState::Reconnecting { attempt } if *attempt >= 2)),
    )
    .await
    .expect("no retry observed")
    .unwrap();

    bridge.disconnect().await;
    assert_eq!(bridge.state(), ConnectionState::Disconnected);
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn handlers_share_one_broker_subscription() {
    let (url, broker) = start_broker().await;
    let (bridge, _tokens) = bridge_for(&url);
    bridge.connect(|| {});
    wait_connected(&bridge).await;

    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    let a = bridge.subscribe(&Topic::Tasks, Arc::clone(&first)).unwrap();
    let b = bridge.subscribe(&Topic::Tasks, second).unwrap();
    // Same handler again: no new registration.
    let again = bridge.subscribe(&Topic::Tasks, first).unwrap();
    assert_eq!(again, a);
    assert_eq!(bridge.handler_count(&Topic::Tasks), 2);

    eventually("subscription", || async {
        broker.subscriber_count("/topic/tasks").await == 1
    })
    .await;

    assert_eq!(broker.publish("/topic/tasks", br#"{"id":7,"status":"COMPLETED"}"#).await, 1);
    let got = recv(&mut first_rx).await;
    assert_eq!(got.topic, Topic::Tasks);
    assert_eq!(got.body["id"], 7);
    assert_eq!(recv(&mut second_rx).await.body["status"], "COMPLETED");

    bridge.unsubscribe(&a);
    assert_eq!(bridge.handler_count(&Topic::Tasks), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.subscriber_count("/topic/tasks").await, 1);

    bridge.unsubscribe(&b);
    eventually("unsubscribe", || async {
        broker.subscriber_count("/topic/tasks").await == 0
    })
    .await;

    bridge.disconnect().await;
}

#[tokio::test]
async fn plain_text_bodies_arrive_as_strings() {
    let (url, broker) = start_broker().await;
    let (bridge, _tokens) = bridge_for(&url);
    bridge.connect(|| {});
    wait_connected(&bridge).await;

    let topic = Topic::TaskComments(12);
    let (handler, mut rx) = collector();
    bridge.subscribe(&topic, handler).unwrap();
    eventually("subscription", || async {
        broker.subscriber_count("/topic/tasks/12/comments").await == 1
    })
    .await;

    broker.publish("/topic/tasks/12/comments", b"updated").await;
    let got = recv(&mut rx).await;
    assert_eq!(got.topic, topic);
    assert_eq!(got.body, serde_json::Value::String("updated".into()));

    bridge.disconnect().await;
}

#[tokio::test]
async fn malformed_json_is_skipped_and_the_session_survives() {
    let (url, broker) = start_broker().await;
    let (bridge, _tokens) = bridge_for(&url);
    bridge.connect(|| {});
    wait_connected(&bridge).await;

    let (handler, mut rx) = collector();
    bridge.subscribe(&Topic::Tasks, handler).unwrap();
    eventually("subscription", || async {
        broker.subscriber_count("/topic/tasks").await == 1
    })
    .await;

    broker.publish("/topic/tasks", b"{\"id\":").await;
    broker.publish("/topic/tasks", br#"{"id":2}"#).await;
    assert_eq!(recv(&mut rx).await.body["id"], 2);
    assert!(bridge.is_connected());

    bridge.disconnect().await;
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test]
async fn reconnect_drops_subscriptions_and_reruns_on_ready() {
    let (url, broker) = start_broker().await;
    let (bridge, _tokens) = bridge_for(&url);
    let (handler, mut rx) = collector();
    let ready = Arc::new(AtomicUsize::new(0));

    let resubscriber = bridge.clone();
    let counter = Arc::clone(&ready);
    bridge.connect(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        resubscriber.subscribe(&Topic::Tasks, Arc::clone(&handler));
    });
    wait_connected(&bridge).await;
    eventually("first subscription", || async {
        broker.subscriber_count("/topic/tasks").await == 1
    })
    .await;

    broker.close_all_connections().await;
    eventually("second handshake", || async { ready.load(Ordering::SeqCst) == 2 }).await;
    eventually("resubscription", || async {
        broker.subscriber_count("/topic/tasks").await == 1
    })
    .await;
    assert_eq!(bridge.handler_count(&Topic::Tasks), 1);

    broker.publish("/topic/tasks", br#"{"id":3}"#).await;
    assert_eq!(recv(&mut rx).await.body["id"], 3);

    bridge.disconnect().await;
}
