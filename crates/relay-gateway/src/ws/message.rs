use axum::extract::ws::{Message, WebSocket};
use relay_protocol::frames::{InboundFrame, ResFrame};
use relay_protocol::handshake::ConnectParams;
use relay_protocol::methods::CONNECT;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::ws::connection::ConnState;
use crate::ws::{dispatch, handshake, send};

type WsSink = futures_util::stream::SplitSink<WebSocket, Message>;

/// Process one inbound WS text frame. Returns the new connection state.
pub async fn handle(conn_id: &str, text: &str, state: ConnState, tx: &mut WsSink, app: &Arc<AppState>) -> ConnState {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(conn_id, error = %e, "malformed frame");
            return state;
        }
    };

    match state {
        ConnState::AwaitingConnect => handle_auth(conn_id, frame, tx, app).await,
        ConnState::Authenticated { granted_scopes, connection_id, mut subscribed_sessions } => {
            if let Some(req) = frame.as_req() {
                if req.method == relay_protocol::methods::AGENT || req.method == relay_protocol::methods::CHAT_SEND {
                    if let Some(key) = req.params.as_ref().and_then(|p| p.get("session_key")).and_then(|v| v.as_str()) {
                        subscribed_sessions.insert(key.to_string());
                    }
                }
                let res = dispatch::route(&req.method, req.params.as_ref(), &req.id, app, &granted_scopes).await;
                let _ = send::json(tx, &res).await;
            }
            ConnState::Authenticated { granted_scopes, connection_id, subscribed_sessions }
        }
        ConnState::Closing => ConnState::Closing,
    }
}

/// Pre-auth: only `connect` is accepted. Any other first frame is a
/// protocol violation (spec §4.9): reply `not_connected` and close.
async fn handle_auth(conn_id: &str, frame: InboundFrame, tx: &mut WsSink, app: &Arc<AppState>) -> ConnState {
    let Some(req) = frame.as_req() else {
        let res = ResFrame::err("", "not_connected", "first frame must be a request");
        let _ = send::json(tx, &res).await;
        return ConnState::Closing;
    };

    if req.method != CONNECT {
        let res = ResFrame::err(&req.id, "not_connected", "must send 'connect' first");
        let _ = send::json(tx, &res).await;
        return ConnState::Closing;
    }

    let params: ConnectParams = match req.params.and_then(|p| serde_json::from_value(p).ok()) {
        Some(p) => p,
        None => {
            let res = ResFrame::err(&req.id, "invalid_params", "invalid connect params");
            let _ = send::json(tx, &res).await;
            return ConnState::Closing;
        }
    };

    match handshake::verify_auth(&params, &app.config) {
        Ok(()) => {
            let hello = handshake::hello_ok_payload(&params);
            let granted_scopes = hello.granted_scopes.clone();
            let connection_id = hello.connection_id.clone();
            let res = ResFrame::ok(&req.id, hello);
            let _ = send::json(tx, &res).await;
            info!(conn_id, "client authenticated");
            ConnState::Authenticated { granted_scopes, connection_id, subscribed_sessions: Default::default() }
        }
        Err(reason) => {
            warn!(conn_id, %reason, "auth failed");
            let res = ResFrame::err(&req.id, "auth_error", &reason);
            let _ = send::json(tx, &res).await;
            ConnState::Closing
        }
    }
}
