//! Connect handshake (spec §4.9): verify the client's `AuthPayload` against
//! the gateway's configured `AuthMode`, and build the `hello-ok` response.

use relay_core::config::{AuthMode, RelayConfig, MAX_PAYLOAD_BYTES, PROTOCOL_VERSION};
use relay_core::types::ConnId;
use relay_protocol::handshake::{
    AuthPayload, ClientPolicy, ConnectParams, HelloOk, ServerFeatures, ServerInfo,
};
use relay_protocol::methods::Scope;

const ALL_SCOPES: [Scope; 5] = [Scope::Read, Scope::Write, Scope::Admin, Scope::Approvals, Scope::Pairing];

/// Check the client's offered credential against the configured auth mode.
/// `AuthPayload` carries more variants than `AuthMode` configures — a server
/// running in `token` mode only understands `AuthPayload::Token`; anything
/// else is a protocol mismatch, not a wrong password, but both surface the
/// same way to the client: handshake rejected.
pub fn verify_auth(params: &ConnectParams, config: &RelayConfig) -> Result<(), String> {
    match config.gateway.auth.mode {
        AuthMode::None => Ok(()),

        AuthMode::Token => match &params.auth {
            AuthPayload::Token { token } => {
                if Some(token) == config.gateway.auth.token.as_ref() {
                    Ok(())
                } else {
                    Err("invalid token".to_string())
                }
            }
            other => Err(format!("server requires token auth, got {other:?}")),
        },
    }
}

/// Scopes granted for this connection. Without a role/permission story yet
/// (`ServerFeatures::role_permissions` is false below), the server simply
/// grants whatever the client asked for, falling back to every scope when
/// the client didn't narrow its request.
fn grant_scopes(params: &ConnectParams) -> Vec<Scope> {
    if params.requested_scopes.is_empty() {
        ALL_SCOPES.to_vec()
    } else {
        params.requested_scopes.clone()
    }
}

/// Build the `hello-ok` response payload after successful authentication.
pub fn hello_ok_payload(params: &ConnectParams) -> HelloOk {
    HelloOk {
        protocol: PROTOCOL_VERSION.min(params.max_protocol),
        server: ServerInfo {
            name: "relay-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            node_id: "primary".to_string(),
        },
        features: ServerFeatures {
            streaming: true,
            multi_agent: true,
            persistent_users: false,
            cross_channel_memory: true,
            role_permissions: false,
            prompt_caching: true,
        },
        snapshot: serde_json::Value::Object(Default::default()),
        policy: ClientPolicy { max_message_size: MAX_PAYLOAD_BYTES, rate_limit: None },
        connection_id: ConnId::new().as_str().to_string(),
        granted_scopes: grant_scopes(params),
    }
}
