use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Wire/protocol constants (spec §4.9, §5, §6).
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 8790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024;
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const IDLE_TIMEOUT_SECS: u64 = 120;
pub const EVENT_BUFFER_CAPACITY: usize = 1000;
pub const CHANNEL_SEND_TIMEOUT_SECS: u64 = 30;
pub const RECONNECT_BASE_SECS: u64 = 1;
pub const RECONNECT_FACTOR: u64 = 2;
pub const RECONNECT_CAP_SECS: u64 = 60;
pub const RECONNECT_JITTER_FRACTION: f64 = 0.20;

/// Top-level config (`relay.toml` + `RELAY_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Named RuntimeEnvs (spec §4.10). At least one, conventionally "default".
    #[serde(default = "default_envs")]
    pub envs: HashMap<String, RuntimeEnvConfig>,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            workspace: WorkspaceConfig::default(),
            envs: default_envs(),
            channels: ChannelsConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn default_envs() -> HashMap<String, RuntimeEnvConfig> {
    let mut m = HashMap::new();
    m.insert("default".to_string(), RuntimeEnvConfig::default());
    m
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    pub auth: AuthConfig,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth: AuthConfig { mode: AuthMode::Token, token: Some("change-me".to_string()) },
            idle_timeout_secs: IDLE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    Token,
    None,
}

/// Root directory for JSON-file persistence: `<root>/.sessions`,
/// `<root>/.cron`, `<root>/.pairing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_dir")]
    pub root: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self { root: default_workspace_dir() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEnvConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default = "default_session_queue_bound")]
    pub session_queue_bound: usize,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
}

impl Default for RuntimeEnvConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            max_tool_rounds: default_max_tool_rounds(),
            session_queue_bound: default_session_queue_bound(),
            keep_recent: default_keep_recent(),
            default_model: default_model(),
            fallback_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    pub telegram: Option<ChannelEntryConfig>,
    pub discord: Option<ChannelEntryConfig>,
    pub slack: Option<ChannelEntryConfig>,
}

/// One configured channel. `credential_env` names the environment variable
/// holding the platform credential; the value itself is never stored in
/// config (spec §1(vi): no persistence of auth keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntryConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub credential_env: String,
    #[serde(default)]
    pub dm_policy: DmPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DmPolicy {
    #[default]
    Open,
    Pairing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub default_overlap_policy: OverlapPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { default_overlap_policy: OverlapPolicy::Skip }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    Queue,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_idle_timeout() -> u64 {
    IDLE_TIMEOUT_SECS
}
fn default_max_context_tokens() -> u32 {
    8_000
}
fn default_max_tool_rounds() -> u32 {
    8
}
fn default_session_queue_bound() -> usize {
    16
}
fn default_keep_recent() -> usize {
    10
}
fn default_model() -> String {
    "default".to_string()
}
fn default_workspace_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/workspace", home)
}

impl RelayConfig {
    /// Load config from a TOML file with `RELAY_*` env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.map(String::from).unwrap_or_else(default_config_path);

        let config: RelayConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RELAY_").split("_"))
            .extract()
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/relay.toml", home)
}
