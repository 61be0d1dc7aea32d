use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When a job fires (§4.8). `Cron` follows a standard 5-field expression
/// with seconds optional; all three variants are interpreted in UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once at the given instant.
    AtOnce { at: DateTime<Utc> },
    /// Fire every `interval_secs`, starting at `anchor`.
    Every { interval_secs: u64, anchor: DateTime<Utc> },
    /// Standard cron expression.
    Cron { expr: String },
}

/// What happens when a job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Publish an event on the bus.
    SystemEvent { event_type: String, data: serde_json::Value },
    /// Run a turn in an existing (or new) session.
    AgentTurn { session_id: String, prompt: String },
    /// Send a message out through a registered channel.
    ChannelSend { channel_id: String, target: String, body: String },
}

/// What the tick loop does when a job's previous run is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop this fire and bump `skipped_overrun` (default).
    #[default]
    Skip,
    /// Queue behind the in-flight run.
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub error: Option<String>,
}

/// A persisted job record (§3 Cron Job).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub action: Action,
    pub enabled: bool,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<RunResult>,
    /// Count of fires dropped because the previous run hadn't finished and
    /// `overlap_policy` is `Skip`.
    #[serde(default)]
    pub skipped_overrun: u32,
    /// `degraded` per §4.8: set after a dispatch failure, cleared on the
    /// next successful run.
    #[serde(default)]
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of `workspace/.cron/runs.jsonl` (§6 Cron store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error: Option<String>,
}
