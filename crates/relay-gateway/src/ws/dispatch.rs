//! Method routing for the RPC surface (spec §4.9). Every method but
//! `methods.list` is scope-checked against [`relay_protocol::methods::REGISTRY`]
//! before its handler runs; text deltas and tool progress for `agent`/
//! `chat.send` reach the client through the Event Bus broadcast in
//! `ws::connection`, not through this function's return value — the `res`
//! it returns is only the turn's final outcome.

use std::sync::Arc;

use relay_core::config::OverlapPolicy as CoreOverlapPolicy;
use relay_core::types::SessionId;
use relay_protocol::frames::ResFrame;
use relay_protocol::methods::{self, Scope};
use relay_scheduler::{Action, Schedule};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::app::AppState;

pub async fn route(
    method: &str,
    params: Option<&serde_json::Value>,
    req_id: &str,
    app: &Arc<AppState>,
    granted_scopes: &[Scope],
) -> ResFrame {
    if method == methods::METHODS_LIST {
        let listed: Vec<serde_json::Value> = methods::REGISTRY
            .iter()
            .map(|m| serde_json::json!({ "name": m.name, "scope": scope_name(m.scope), "streams": m.streams }))
            .collect();
        return ResFrame::ok(req_id, serde_json::json!({ "methods": listed }));
    }

    let Some(descriptor) = methods::lookup(method) else {
        return ResFrame::err(req_id, "unknown_method", &format!("unknown method '{method}'"));
    };
    if !granted_scopes.contains(&descriptor.scope) {
        return ResFrame::err(req_id, "forbidden", &format!("method '{method}' requires scope {:?}", descriptor.scope));
    }

    match method {
        m if m == methods::AGENT => handle_agent(params, req_id, app).await,
        m if m == methods::CHAT_SEND => handle_chat_send(params, req_id, app).await,
        m if m == methods::SESSIONS_LIST => handle_sessions_list(req_id, app),
        m if m == methods::SESSIONS_GET => handle_sessions_get(params, req_id, app).await,
        m if m == methods::SESSIONS_DELETE => handle_sessions_delete(params, req_id, app).await,
        m if m == methods::CHANNELS_STATUS => handle_channels_status(req_id, app).await,
        m if m == methods::CHANNELS_START => handle_channel_lifecycle(params, req_id, app, ChannelOp::Start).await,
        m if m == methods::CHANNELS_STOP => handle_channel_lifecycle(params, req_id, app, ChannelOp::Stop).await,
        m if m == methods::CHANNELS_RESTART => handle_channel_lifecycle(params, req_id, app, ChannelOp::Restart).await,
        m if m == methods::CONFIG_GET => handle_config_get(req_id, app),
        m if m == methods::CONFIG_SET => ResFrame::err(req_id, "invalid_params", "config.set is read-only in this deployment"),
        m if m == methods::CRON_LIST => handle_cron_list(req_id, app).await,
        m if m == methods::CRON_ADD => handle_cron_add(params, req_id, app).await,
        m if m == methods::CRON_DELETE => handle_cron_delete(params, req_id, app).await,
        m if m == methods::CRON_SET_ENABLED => handle_cron_set_enabled(params, req_id, app).await,
        m if m == methods::HEALTH_CHECK => handle_health_check(req_id, app).await,
        m if m == methods::LOGS_TAIL => ResFrame::ok(req_id, serde_json::json!({ "lines": [] })),
        m if m == methods::APPROVALS_LIST => handle_approvals_list(req_id, app),
        m if m == methods::APPROVALS_DECIDE => handle_approvals_decide(params, req_id, app),
        m if m == methods::PAIRING_APPROVE => handle_pairing_approve(params, req_id, app).await,
        _ => ResFrame::err(req_id, "unknown_method", &format!("unknown method '{method}'")),
    }
}

fn scope_name(scope: Scope) -> &'static str {
    match scope {
        Scope::Read => "read",
        Scope::Write => "write",
        Scope::Admin => "admin",
        Scope::Approvals => "approvals",
        Scope::Pairing => "pairing",
    }
}

fn param<T: serde::de::DeserializeOwned>(params: Option<&serde_json::Value>, field: &str) -> Option<T> {
    serde_json::from_value(params?.get(field)?.clone()).ok()
}

async fn handle_agent(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(message) = param::<String>(params, "message") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'message'");
    };
    let session_key = param::<String>(params, "session_key").unwrap_or_else(|| format!("rpc:{}", Uuid::new_v4()));
    run_turn_and_respond(req_id, app, session_key, message, None).await
}

async fn handle_chat_send(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(session_key) = param::<String>(params, "session_key") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'session_key'");
    };
    let Some(message) = param::<String>(params, "message") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'message'");
    };
    let deliver = param::<Deliver>(params, "deliver");
    run_turn_and_respond(req_id, app, session_key, message, deliver).await
}

#[derive(serde::Deserialize)]
struct Deliver {
    channel_id: String,
    chat_id: String,
}

async fn run_turn_and_respond(
    req_id: &str,
    app: &Arc<AppState>,
    session_key: String,
    message: String,
    deliver: Option<Deliver>,
) -> ResFrame {
    let Some(env) = app.env(None) else {
        return ResFrame::err(req_id, "provider_error", "no runtime environment is available");
    };

    let outcome = env
        .runtime
        .run_turn(SessionId::from(session_key), app.workspace_dir.clone(), message, CancellationToken::new())
        .await;

    match outcome {
        Ok(outcome) => {
            if let Some(deliver) = deliver {
                if let Err(e) = app.channels.send(&deliver.channel_id, &deliver.chat_id, &outcome.final_text).await {
                    tracing::warn!(error = %e, "failed to deliver turn result to channel");
                }
            }
            ResFrame::ok(
                req_id,
                serde_json::json!({
                    "text": outcome.final_text,
                    "cancelled": outcome.cancelled,
                    "used_fallback": outcome.used_fallback,
                    "tool_rounds": outcome.tool_rounds,
                }),
            )
        }
        Err(e) => ResFrame::err(req_id, e.code(), &e.to_string()),
    }
}

fn handle_sessions_list(req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let ids: Vec<String> = app.sessions.list().iter().map(|id| id.to_string()).collect();
    ResFrame::ok(req_id, serde_json::json!({ "sessions": ids }))
}

async fn handle_sessions_get(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(session_key) = param::<String>(params, "session_key") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'session_key'");
    };
    let session = app.sessions.get_or_create(&SessionId::from(session_key)).await;
    ResFrame::ok(req_id, serde_json::to_value(session).unwrap_or_default())
}

async fn handle_sessions_delete(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(session_key) = param::<String>(params, "session_key") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'session_key'");
    };
    match app.sessions.delete(&SessionId::from(session_key)).await {
        Ok(()) => ResFrame::ok(req_id, serde_json::json!({ "deleted": true })),
        Err(e) => ResFrame::err(req_id, "invalid_params", &e.to_string()),
    }
}

async fn handle_channels_status(req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let statuses: Vec<serde_json::Value> = app
        .channels
        .list_status()
        .await
        .into_iter()
        .map(|(id, state)| serde_json::json!({ "channel_id": id, "state": state.to_string() }))
        .collect();
    ResFrame::ok(req_id, serde_json::json!({ "channels": statuses }))
}

enum ChannelOp {
    Start,
    Stop,
    Restart,
}

async fn handle_channel_lifecycle(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>, op: ChannelOp) -> ResFrame {
    let Some(channel_id) = param::<String>(params, "channel_id") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'channel_id'");
    };
    let result = match op {
        ChannelOp::Start => app.channels.start(&channel_id).await,
        ChannelOp::Stop => app.channels.stop(&channel_id).await,
        ChannelOp::Restart => app.channels.restart(&channel_id).await,
    };
    match result {
        Ok(()) => ResFrame::ok(req_id, serde_json::json!({ "ok": true })),
        Err(e) => ResFrame::err(req_id, "channel_unavailable", &e.to_string()),
    }
}

fn handle_config_get(req_id: &str, app: &Arc<AppState>) -> ResFrame {
    ResFrame::ok(req_id, serde_json::to_value(&app.config).unwrap_or_default())
}

async fn handle_cron_list(req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let jobs = app.scheduler.list_jobs().await;
    ResFrame::ok(req_id, serde_json::json!({ "jobs": jobs }))
}

async fn handle_cron_add(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(name) = param::<String>(params, "name") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'name'");
    };
    let Some(schedule) = param::<Schedule>(params, "schedule") else {
        return ResFrame::err(req_id, "invalid_params", "missing or invalid 'schedule'");
    };
    let Some(action) = param::<Action>(params, "action") else {
        return ResFrame::err(req_id, "invalid_params", "missing or invalid 'action'");
    };
    let overlap_policy = param::<CoreOverlapPolicy>(params, "overlap_policy").unwrap_or_default();
    let overlap_policy = match overlap_policy {
        CoreOverlapPolicy::Skip => relay_scheduler::OverlapPolicy::Skip,
        CoreOverlapPolicy::Queue => relay_scheduler::OverlapPolicy::Queue,
    };
    match app.scheduler.add_job(&name, schedule, action, overlap_policy).await {
        Ok(job) => ResFrame::ok(req_id, serde_json::to_value(job).unwrap_or_default()),
        Err(e) => ResFrame::err(req_id, "invalid_params", &e.to_string()),
    }
}

async fn handle_cron_delete(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(id) = param::<String>(params, "id") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'id'");
    };
    match app.scheduler.remove_job(&id).await {
        Ok(()) => ResFrame::ok(req_id, serde_json::json!({ "deleted": true })),
        Err(e) => ResFrame::err(req_id, "invalid_params", &e.to_string()),
    }
}

async fn handle_cron_set_enabled(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(id) = param::<String>(params, "id") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'id'");
    };
    let Some(enabled) = param::<bool>(params, "enabled") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'enabled'");
    };
    match app.scheduler.set_enabled(&id, enabled).await {
        Ok(job) => ResFrame::ok(req_id, serde_json::to_value(job).unwrap_or_default()),
        Err(e) => ResFrame::err(req_id, "invalid_params", &e.to_string()),
    }
}

async fn handle_health_check(req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let channels = app.channels.list_status().await;
    ResFrame::ok(
        req_id,
        serde_json::json!({
            "envs": app.envs.keys().collect::<Vec<_>>(),
            "channels": channels.into_iter().map(|(id, s)| serde_json::json!({"channel_id": id, "state": s.to_string()})).collect::<Vec<_>>(),
        }),
    )
}

fn handle_approvals_list(req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let approvals = app.approvals.list();
    ResFrame::ok(req_id, serde_json::json!({ "approvals": approvals }))
}

fn handle_approvals_decide(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(id) = param::<String>(params, "id") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'id'");
    };
    let Some(approve) = param::<bool>(params, "approve") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'approve'");
    };
    match app.approvals.decide(&id, approve) {
        Ok(()) => ResFrame::ok(req_id, serde_json::json!({ "ok": true, "approved": approve })),
        Err(e) => ResFrame::err(req_id, "invalid_params", &e.to_string()),
    }
}

async fn handle_pairing_approve(params: Option<&serde_json::Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let Some(channel_id) = param::<String>(params, "channel_id") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'channel_id'");
    };
    let Some(code) = param::<String>(params, "code") else {
        return ResFrame::err(req_id, "invalid_params", "missing 'code'");
    };
    match app.channels.approve_pairing(&channel_id, &code).await {
        Some(chat_id) => ResFrame::ok(req_id, serde_json::json!({ "chat_id": chat_id })),
        None => ResFrame::err(req_id, "invalid_params", "unknown pairing code"),
    }
}
