//! Supervisor and session loop for the broker connection.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use taskflow_proto::stomp::{self, Command, Frame, HeartBeat};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, OnReady, RealtimeError, Shared};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How a session ended without an error.
enum SessionEnd {
    /// `disconnect()` was requested.
    Cancelled,
    /// The broker closed the socket.
    Dropped,
}

/// Keep a session running until cancelled, reconnecting after a fixed
/// delay whenever the transport goes away.
pub(super) async fn supervise(shared: Arc<Shared>, on_ready: OnReady, cancel: CancellationToken) {
    let mut failures: u32 = 0;
    shared.set_state(ConnectionState::Connecting);

    loop {
        let mut handshook = false;
        let result = run_session(&shared, &on_ready, &cancel, &mut handshook).await;
        shared.detach();

        match result {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Dropped) => {
                tracing::info!(url = %shared.config.url, "broker closed the connection");
            }
            Err(e) => {
                tracing::warn!(url = %shared.config.url, err = %e, "realtime session failed");
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        failures = if handshook { 1 } else { failures.saturating_add(1) };
        shared.set_state(ConnectionState::Reconnecting { attempt: failures });
        tracing::debug!(
            attempt = failures,
            delay_ms = u64::try_from(shared.config.reconnect_delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(shared.config.reconnect_delay) => {}
        }
    }

    shared.detach();
    shared.set_state(ConnectionState::Disconnected);
    tracing::info!("realtime supervisor exiting");
}

/// One socket lifetime: open, handshake, pump frames.
async fn run_session(
    shared: &Shared,
    on_ready: &OnReady,
    cancel: &CancellationToken,
    handshook: &mut bool,
) -> Result<SessionEnd, RealtimeError> {
    let config = &shared.config;
    let opened = tokio::select! {
        () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        res = tokio::time::timeout(config.connect_timeout, handshake(shared)) => res,
    };
    let (ws, server_hb) = opened.map_err(|_| {
        tracing::warn!(url = %config.url, "realtime connect timed out");
        RealtimeError::Timeout
    })??;
    *handshook = true;

    let (send_every, expect_within) = HeartBeat::negotiate(config.heart_beat, server_hb);
    // Allow the broker twice its interval before declaring the link dead.
    let silence_limit = expect_within.map(|d| d * 2);
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    shared.attach(tx);
    shared.set_state(ConnectionState::Connected);
    tracing::info!(url = %config.url, ?send_every, ?expect_within, "realtime connected");
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_ready())).is_err() {
        tracing::warn!("on_ready callback panicked");
    }

    let mut beat = send_every.map(tokio::time::interval);
    let mut last_seen = Instant::now();

    loop {
        let silence_deadline = silence_limit.map(|limit| last_seen + limit);
        tokio::select! {
            () = cancel.cancelled() => {
                let bye = stomp::encode(&Frame::disconnect("bye"));
                let _ = sink.send(Message::Text(String::from_utf8_lossy(&bye).into_owned().into())).await;
                let _ = sink.close().await;
                return Ok(SessionEnd::Cancelled);
            }
            Some(frame) = rx.recv() => {
                let bytes = stomp::encode(&frame);
                sink.send(Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()))
                    .await
                    .map_err(|e| RealtimeError::Closed(e.to_string()))?;
            }
            () = tick(beat.as_mut()) => {
                sink.send(Message::Text("\n".into()))
                    .await
                    .map_err(|e| RealtimeError::Closed(e.to_string()))?;
            }
            () = sleep_until(silence_deadline) => {
                return Err(RealtimeError::HeartbeatTimeout(silence_limit.unwrap_or_default()));
            }
            msg = stream.next() => {
                last_seen = Instant::now();
                let data = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Dropped),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(RealtimeError::Closed(e.to_string())),
                };
                let frames = match stomp::decode(&data) {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::warn!(err = %e, "malformed frame from broker, skipping");
                        continue;
                    }
                };
                for frame in frames {
                    match frame.command {
                        Command::Message => shared.dispatch(&frame),
                        Command::Error => {
                            let message = frame.get("message").map_or_else(|| frame.body_text(), str::to_string);
                            tracing::warn!(%message, "broker sent ERROR");
                            return Err(RealtimeError::Broker(message));
                        }
                        Command::Receipt => tracing::trace!(receipt = ?frame.get("receipt-id"), "receipt"),
                        other => tracing::debug!(command = %other, "ignoring frame"),
                    }
                }
            }
        }
    }
}

/// Open the socket and complete the STOMP handshake. Returns the broker's
/// heart-beat reply.
async fn handshake(shared: &Shared) -> Result<(WsStream, HeartBeat), RealtimeError> {
    let url = &shared.config.url;
    let (mut ws, _response) = connect_async(url.as_str()).await.map_err(|e| {
        tracing::warn!(%url, err = %e, "realtime websocket connect failed");
        RealtimeError::Connect {
            url: url.clone(),
            message: e.to_string(),
        }
    })?;

    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let token = shared.tokens.access_token();
    let connect = stomp::encode(&Frame::connect(&host, shared.config.heart_beat, token.as_deref()));
    ws.send(Message::Text(String::from_utf8_lossy(&connect).into_owned().into()))
        .await
        .map_err(|e| RealtimeError::Closed(e.to_string()))?;

    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Close(_))) | None => {
                return Err(RealtimeError::Closed("closed during handshake".to_string()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(RealtimeError::Closed(e.to_string())),
        };
        for frame in stomp::decode(&data)? {
            match frame.command {
                Command::Connected => {
                    let server_hb = frame.get("heart-beat").map(HeartBeat::parse).unwrap_or_default();
                    return Ok((ws, server_hb));
                }
                Command::Error => {
                    let message = frame.get("message").map_or_else(|| frame.body_text(), str::to_string);
                    return Err(RealtimeError::Rejected(message));
                }
                other => tracing::debug!(command = %other, "unexpected frame before CONNECTED"),
            }
        }
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
