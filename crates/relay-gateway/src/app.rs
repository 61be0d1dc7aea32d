//! Central shared state — passed as `Arc<AppState>` to every WS connection
//! task and RPC handler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{routing::get, Router};
use relay_bus::EventBus;
use relay_channels::ChannelManager;
use relay_core::config::{RelayConfig, RuntimeEnvConfig};
use relay_runtime::AgentRuntime;
use relay_scheduler::SchedulerHandle;
use relay_sessions::SessionStore;
use relay_tools::{ApprovalStore, ToolRegistry};

/// One named configuration of session store, tool registry, LLM provider and
/// runtime (spec §4.10). The Channel Manager maps each channel to one of
/// these by name; the gateway RPC surface defaults to `"default"` when a
/// caller doesn't name one.
pub struct RuntimeEnv {
    pub tool_registry: Arc<ToolRegistry>,
    pub runtime: Arc<AgentRuntime>,
    pub config: RuntimeEnvConfig,
}

pub struct AppState {
    pub config: RelayConfig,
    pub workspace_dir: PathBuf,
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionStore>,
    pub envs: HashMap<String, RuntimeEnv>,
    pub default_env: String,
    pub channels: Arc<ChannelManager>,
    pub scheduler: Arc<SchedulerHandle>,
    pub approvals: Arc<ApprovalStore>,
    event_seq: AtomicU64,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        workspace_dir: PathBuf,
        bus: Arc<EventBus>,
        sessions: Arc<SessionStore>,
        envs: HashMap<String, RuntimeEnv>,
        default_env: String,
        channels: Arc<ChannelManager>,
        scheduler: Arc<SchedulerHandle>,
        approvals: Arc<ApprovalStore>,
    ) -> Self {
        Self {
            config,
            workspace_dir,
            bus,
            sessions,
            envs,
            default_env,
            channels,
            scheduler,
            approvals,
            event_seq: AtomicU64::new(0),
        }
    }

    /// Monotonically increasing sequence stamped onto outbound `event` frames.
    pub fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn env(&self, name: Option<&str>) -> Option<&RuntimeEnv> {
        self.envs.get(name.unwrap_or(&self.default_env))
    }
}

/// Assemble the Axum router. The RPC surface lives entirely on the `/ws`
/// upgrade (spec §4.9); `/health` is a plain liveness probe for process
/// supervisors that can't speak the WS protocol.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}
