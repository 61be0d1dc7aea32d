//! Startup/shutdown sequencing (spec §4.10): build every component in the
//! mandated order, wire cross-crate collaborators through thin dispatcher
//! adapters, and unwind anything already started if a later step fails.
//!
//! Order: config → event bus → per-env session store/tool registry/provider
//! → per-env runtime → cron store + unbound channel accessor → channel
//! manager (bind the accessor) → start the cron tick loop → bind the RPC
//! listener → start channel plugins → publish `SYSTEM_STARTUP` → serve until
//! `SIGINT`, then publish `SYSTEM_SHUTDOWN` and stop every channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use relay_bus::EventBus;
use relay_channels::ChannelManager;
use relay_core::config::RelayConfig;
use relay_core::types::{Event, EventType};
use relay_runtime::{AgentRuntime, CharHeuristicEstimator, PromptBuilder, TurnConfig};
use relay_scheduler::{
    ChannelAccessor, ChannelDispatcher, CronStore, SchedulerEngine, SchedulerHandle, TurnDispatcher,
};
use relay_sessions::SessionStore;
use relay_tools::{ApprovalStore, PolicyChain, ToolRegistry};

use crate::app::{AppState, RuntimeEnv};

const PERSONA: &str = "You are a personal AI-assistant gateway, acting on \
behalf of a single operator across chat channels, the RPC surface, and \
scheduled work. Be direct, do the work, and say plainly when you can't.";

/// Components already started, torn down in reverse order if a later step
/// in [`run`] fails. Anything that was only *constructed*, never started
/// (e.g. an `AgentRuntime` before any turn ran against it), needs no entry
/// here — there's nothing running to stop.
struct Started {
    shutdown_tx: Option<watch::Sender<bool>>,
    channels: Option<Arc<ChannelManager>>,
    sessions: Option<Arc<SessionStore>>,
}

impl Started {
    fn empty() -> Self {
        Self { shutdown_tx: None, channels: None, sessions: None }
    }

    async fn rollback(self) {
        warn!("bootstrap failed, rolling back already-started components");
        if let Some(tx) = self.shutdown_tx {
            let _ = tx.send(true);
        }
        if let Some(channels) = self.channels {
            for (id, _) in channels.list_status().await {
                let _ = channels.stop(&id).await;
            }
        }
        if let Some(sessions) = self.sessions {
            sessions.flush_all().await;
        }
    }
}

pub async fn run() -> Result<()> {
    let mut started = Started::empty();
    let state = match build(&mut started).await {
        Ok(state) => state,
        Err(e) => {
            started.rollback().await;
            return Err(e);
        }
    };

    let addr: SocketAddr = format!("{}:{}", state.config.gateway.bind, state.config.gateway.port)
        .parse()
        .context("invalid gateway bind address")?;

    let router = crate::app::build_router(state.clone());
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            started.rollback().await;
            return Err(e).context("binding gateway listener");
        }
    };
    info!(%addr, "relay gateway listening");

    // Step 9: start channel plugins per policy. No concrete adapter is
    // registered today (see `register_channels`), so this loop currently
    // has nothing to iterate; it's wired so a future adapter only needs to
    // flip `ChannelEntryConfig::enabled` to auto-start on boot.
    for (channel_id, _) in state.channels.list_status().await {
        if let Err(e) = state.channels.start(&channel_id).await {
            warn!(channel_id, error = %e, "channel failed to start at boot, leaving it stopped");
        }
    }

    state.bus.publish(Event::new(EventType::SystemStartup, "gateway", serde_json::json!({"addr": addr.to_string()})));

    tokio::select! {
        result = async { axum::serve(listener, router).await } => {
            result.context("gateway server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    state.bus.publish(Event::new(EventType::SystemShutdown, "gateway", serde_json::json!({})));
    if let Some(tx) = started.shutdown_tx.take() {
        let _ = tx.send(true);
    }
    for (channel_id, _) in state.channels.list_status().await {
        let _ = state.channels.stop(&channel_id).await;
    }
    Ok(())
}

async fn build(started: &mut Started) -> Result<Arc<AppState>> {
    // Step 1: config, overridden by the environment variables spec §6 names.
    let config_path = std::env::var("RELAY_CONFIG").ok();
    let mut config = RelayConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, falling back to defaults");
        RelayConfig::default()
    });
    if let Ok(dir) = std::env::var("WORKSPACE_DIR") {
        config.workspace.root = dir;
    }
    if let Some(port) = std::env::var("GATEWAY_PORT").ok().and_then(|p| p.parse().ok()) {
        config.gateway.port = port;
    }

    let workspace_dir = PathBuf::from(&config.workspace.root);
    std::fs::create_dir_all(&workspace_dir).context("creating workspace directory")?;

    // Step 2: Event Bus.
    let bus = Arc::new(EventBus::new(false));

    // Step 3 + 4: per-env Session Store, Tool Registry, LLM Provider, Runtime.
    // The Session Store is shared across environments — `WorkspaceConfig` is
    // a single root, not one per environment — while the registry, provider
    // router and runtime are built fresh per environment so each can carry
    // its own model, policy, and context budget.
    let sessions = Arc::new(SessionStore::new(workspace_dir.clone()));
    started.sessions = Some(sessions.clone());

    // Every environment's registry shares one approval store: the
    // `approvals.list`/`approvals.decide` RPC methods take no env argument,
    // so a suspended call needs to be findable regardless of which
    // environment's policy chain raised it.
    let approvals = Arc::new(ApprovalStore::new());

    let mut envs: HashMap<String, RuntimeEnv> = HashMap::new();
    for (name, env_config) in &config.envs {
        let tool_registry = Arc::new(ToolRegistry::with_approvals(PolicyChain::allow_all(), approvals.clone()));
        register_tools(&tool_registry);

        let router = Arc::new(build_router_for_env(env_config));

        let runtime = Arc::new(AgentRuntime::new(
            sessions.clone(),
            tool_registry.clone(),
            router,
            bus.clone(),
            PromptBuilder::new(PERSONA),
            Arc::new(CharHeuristicEstimator),
            TurnConfig::from(env_config),
            format!("runtime:{name}"),
        ));

        envs.insert(name.clone(), RuntimeEnv { tool_registry, runtime, config: env_config.clone() });
    }

    if envs.is_empty() {
        anyhow::bail!("no runtime environment is configured");
    }

    let default_env = if envs.contains_key("default") {
        "default".to_string()
    } else {
        envs.keys().next().cloned().expect("envs checked non-empty above")
    };

    // Step 5: initialize (not start) the Cron Service — the channel
    // accessor stays unbound until step 6, so a job that fires between now
    // and then would fail `ChannelSend` lookups; nothing can fire yet
    // because the tick loop itself isn't running until step 7.
    let cron_store = Arc::new(CronStore::new(&workspace_dir));
    let channel_accessor = ChannelAccessor::new();
    let turn_dispatcher: Arc<dyn TurnDispatcher> = Arc::new(GatewayTurnDispatcher {
        runtime: envs.get(&default_env).expect("default_env exists").runtime.clone(),
        workspace_dir: workspace_dir.clone(),
    });
    let scheduler_engine = Arc::new(SchedulerEngine::new(
        cron_store.clone(),
        bus.clone(),
        turn_dispatcher,
        channel_accessor.clone(),
        "cron",
    ));
    let scheduler = Arc::new(SchedulerHandle::new(cron_store));

    // Step 6: Channel Manager; register configured channels; bind the
    // accessor the Cron Service has been holding onto since step 5.
    let channels = Arc::new(ChannelManager::new(bus.clone()));
    started.channels = Some(channels.clone());
    register_channels(&config);
    channel_accessor.bind(Arc::new(GatewayChannelDispatcher { channels: channels.clone() }));

    // Step 7: start the Cron Service now that `ChannelSend` resolves.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    started.shutdown_tx = Some(shutdown_tx);
    tokio::spawn(scheduler_engine.run(shutdown_rx));

    Ok(Arc::new(AppState::new(
        config,
        workspace_dir,
        bus,
        sessions,
        envs,
        default_env,
        channels,
        scheduler,
        approvals,
    )))
}

fn register_tools(registry: &ToolRegistry) {
    use relay_tools::tools::{execute_command, list_files, patch_file, read_file, search_files, write_file};

    registry.register(Arc::new(read_file::ReadFileTool));
    registry.register(Arc::new(list_files::ListFilesTool));
    registry.register(Arc::new(write_file::WriteFileTool));
    registry.register(Arc::new(patch_file::PatchFileTool));
    registry.register(Arc::new(search_files::SearchFilesTool));
    registry.register(Arc::new(execute_command::ExecuteCommandTool));
}

/// The concrete LLM SDK a deployment talks to is out of scope here (spec
/// §1): a real deployment supplies its own `LlmProvider` adapter crate and
/// wires it in where `EchoProvider` sits below. Both legs of the route use
/// the same stub since there's nothing to fail over from/to without one.
fn build_router_for_env(env_config: &relay_core::config::RuntimeEnvConfig) -> relay_providers::ProviderRouter {
    use relay_providers::{EchoProvider, ModelRoute, ProviderRouter};

    let primary = ModelRoute::new(env_config.default_model.clone(), vec![Box::new(EchoProvider::new("stub"))]);
    let fallback = env_config
        .fallback_model
        .clone()
        .map(|model| ModelRoute::new(model, vec![Box::new(EchoProvider::new("stub"))]));
    ProviderRouter::new(primary, fallback)
}

/// Channel plugins have no concrete adapter in this codebase yet — only the
/// generic lifecycle framework does. Warn if the operator configured one
/// anyway, rather than silently ignoring it.
fn register_channels(config: &RelayConfig) {
    let configured: [(&str, &Option<relay_core::config::ChannelEntryConfig>); 3] =
        [("telegram", &config.channels.telegram), ("discord", &config.channels.discord), ("slack", &config.channels.slack)];
    for (id, entry) in configured {
        if let Some(entry) = entry {
            if entry.enabled {
                warn!(channel = id, "channel is enabled in config but no adapter is registered for it");
            }
        }
    }
}

/// Dispatches a cron `AgentTurn` action into the default environment's
/// runtime. Cron jobs don't carry a RuntimeEnv name (spec's `Action` has no
/// such field) so every scheduled turn runs in the `"default"` environment.
struct GatewayTurnDispatcher {
    runtime: Arc<AgentRuntime>,
    workspace_dir: PathBuf,
}

#[async_trait]
impl TurnDispatcher for GatewayTurnDispatcher {
    async fn dispatch_turn(&self, session_id: String, prompt: String) -> std::result::Result<(), String> {
        self.runtime
            .run_turn(session_id.into(), self.workspace_dir.clone(), prompt, tokio_util::sync::CancellationToken::new())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Dispatches a cron `ChannelSend` action through the Channel Manager.
struct GatewayChannelDispatcher {
    channels: Arc<ChannelManager>,
}

#[async_trait]
impl ChannelDispatcher for GatewayChannelDispatcher {
    async fn dispatch_send(&self, channel_id: String, target: String, body: String) -> std::result::Result<(), String> {
        self.channels.send(&channel_id, &target, &body).await.map_err(|e| e.to_string())
    }
}
