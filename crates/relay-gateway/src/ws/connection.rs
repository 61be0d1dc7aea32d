use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use relay_core::config::{HANDSHAKE_TIMEOUT_MS, MAX_PAYLOAD_BYTES};
use relay_protocol::frames::EventFrame;
use relay_protocol::methods::Scope;
use tracing::{info, warn};

use crate::app::AppState;
use crate::ws::message;

/// WS connection state machine.
///
/// `AwaitingConnect` → `Authenticated` → (runs until close or idle timeout)
/// → `Closing`. The handshake must complete within `HANDSHAKE_TIMEOUT_MS` or
/// the connection drops.
pub(crate) enum ConnState {
    AwaitingConnect,
    Authenticated { granted_scopes: Vec<Scope>, connection_id: String, subscribed_sessions: HashSet<String> },
    Closing,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

/// Per-connection task — lives for the entire WS session lifetime.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "new WS connection");

    let (mut tx, mut rx) = socket.split();
    let mut conn_state = ConnState::AwaitingConnect;

    let handshake_deadline = tokio::time::Instant::now() + Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
    let mut handshake_timer = Box::pin(tokio::time::sleep_until(handshake_deadline));

    let idle_timeout = Duration::from_secs(state.config.gateway.idle_timeout_secs);
    let mut idle_timer = Box::pin(tokio::time::sleep(idle_timeout));

    // Attached lazily, on the frame that moves this connection into
    // `Authenticated` — a connection that never authenticates never
    // subscribes, so it never competes for a broadcast receiver slot.
    let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<relay_core::types::Event>> = None;

    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        idle_timer.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                        let text_ref: &str = &text;
                        if text_ref.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id, size = text_ref.len(), "payload too large, dropping connection");
                            break;
                        }
                        let was_awaiting = matches!(conn_state, ConnState::AwaitingConnect);
                        conn_state = message::handle(&conn_id, text_ref, conn_state, &mut tx, &state).await;

                        if was_awaiting {
                            if let ConnState::Authenticated { .. } = &conn_state {
                                let (flushed, rx) = state.bus.attach_broadcast();
                                for event in flushed {
                                    if let Some(frame) = event_frame(&state, &conn_state, &event) {
                                        if send_frame(&mut tx, &frame).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                broadcast_rx = Some(rx);
                            }
                        }

                        if matches!(conn_state, ConnState::Closing) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }

            event = recv_broadcast(&mut broadcast_rx) => {
                if let Some(event) = event {
                    if let Some(frame) = event_frame(&state, &conn_state, &event) {
                        if send_frame(&mut tx, &frame).await.is_err() {
                            break;
                        }
                    }
                }
            }

            _ = &mut handshake_timer => {
                if matches!(conn_state, ConnState::AwaitingConnect) {
                    warn!(conn_id, "handshake timeout, closing connection");
                    break;
                }
            }

            _ = &mut idle_timer => {
                info!(conn_id, "idle timeout, closing connection");
                let frame = EventFrame::new("shutdown", serde_json::json!({ "reason": "idle_timeout" }));
                let _ = send_frame(&mut tx, &frame).await;
                break;
            }
        }
    }

    info!(conn_id, "WS connection closed");
}

/// Awaits the next broadcast event if a receiver is attached yet, otherwise
/// never resolves — lets this branch sit idle in the `select!` before auth.
async fn recv_broadcast(
    rx: &mut Option<tokio::sync::broadcast::Receiver<relay_core::types::Event>>,
) -> Option<relay_core::types::Event> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "broadcast receiver lagged, dropping skipped events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => std::future::pending().await,
    }
}

/// Fan-out filter (spec §4.9): forward events with no session scope (system
/// events) unconditionally, and session-scoped events only to connections
/// subscribed to that session.
fn event_frame(state: &Arc<AppState>, conn_state: &ConnState, event: &relay_core::types::Event) -> Option<EventFrame> {
    let ConnState::Authenticated { subscribed_sessions, .. } = conn_state else {
        return None;
    };
    if !event.event_type.is_system() {
        match &event.session_id {
            Some(session_id) if subscribed_sessions.contains(session_id.as_str()) => {}
            _ => return None,
        }
    }
    let event_name = serde_json::to_value(event.event_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_lowercase))
        .unwrap_or_else(|| "event".to_string());
    Some(EventFrame::new(event_name, event.data.clone()).with_seq(state.next_seq()))
}

async fn send_frame(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &EventFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    tx.send(Message::Text(json.into())).await.map_err(axum::Error::new)
}
