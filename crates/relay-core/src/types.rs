use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable, channel-derived session identity, e.g. `telegram:12345`.
///
/// Unlike a user-centric key, a `SessionId` never unifies the same human
/// across two channels — the channel and chat id together are the identity,
/// matching the one-session-per-conversation model the gateway exposes to
/// clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Build the stable id for a given channel and chat. This is the `f`
    /// referenced by the Channel Manager's `session_id = f(channel_id, chat_id)`.
    pub fn from_channel(channel_id: &str, chat_id: &str) -> Self {
        Self(format!("{}:{}", channel_id, chat_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-connection identifier (random UUID, not persisted).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a single message within a session's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Compaction priority of a message. See `relay-sessions::compact`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Normal,
    High,
}

/// A single immutable entry in a session's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultRef>,
    pub timestamp: DateTime<Utc>,
    pub token_estimate: u32,
    pub importance: Importance,
}

/// Reference to a tool invocation requested by an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Reference to the result of a tool invocation, attached to a `tool` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub tool_call_id: String,
    pub ok: bool,
    pub value: serde_json::Value,
}

/// Closed enumeration of event kinds flowing through the Event Bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AgentStart,
    AgentText,
    AgentToolCall,
    AgentToolResult,
    AgentFileGenerated,
    AgentDone,
    AgentError,
    ChannelMessageIn,
    ChannelMessageOut,
    ChannelStateChanged,
    ChannelError,
    CronTick,
    CronRunStart,
    CronRunDone,
    CronRunFailed,
    SystemStartup,
    SystemShutdown,
}

impl EventType {
    pub const ALL: &'static [EventType] = &[
        EventType::AgentStart,
        EventType::AgentText,
        EventType::AgentToolCall,
        EventType::AgentToolResult,
        EventType::AgentFileGenerated,
        EventType::AgentDone,
        EventType::AgentError,
        EventType::ChannelMessageIn,
        EventType::ChannelMessageOut,
        EventType::ChannelStateChanged,
        EventType::ChannelError,
        EventType::CronTick,
        EventType::CronRunStart,
        EventType::CronRunDone,
        EventType::CronRunFailed,
        EventType::SystemStartup,
        EventType::SystemShutdown,
    ];

    /// Events with no `session_id` are "unscoped" — every RPC connection
    /// receives them regardless of session subscription (spec §4.9).
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            EventType::CronTick
                | EventType::CronRunStart
                | EventType::CronRunDone
                | EventType::CronRunFailed
                | EventType::SystemStartup
                | EventType::SystemShutdown
        )
    }
}

/// Parses the same `SCREAMING_SNAKE_CASE` spelling the `serde` rename
/// produces, so a cron job's configured `event_type` string round-trips
/// through the wire format without a separate lookup table.
impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| serde_json::to_value(t).ok().and_then(|v| v.as_str().map(str::to_string)).as_deref() == Some(s))
            .ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

impl TryFrom<&str> for EventType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// An immutable value flowing through the Event Bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            source: source.into(),
            session_id: None,
            channel_id: None,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}

/// Channel lifecycle state machine (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Uninit,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Uninit => "uninit",
            ChannelState::Starting => "starting",
            ChannelState::Running => "running",
            ChannelState::Degraded => "degraded",
            ChannelState::Stopping => "stopping",
            ChannelState::Stopped => "stopped",
            ChannelState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Tool permission tier, used by the policy chain in `relay-tools`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionClass {
    Safe,
    Gated,
    Admin,
}

/// Declared side effects of a tool, used both for policy and for deciding
/// parallel vs sequential execution in the Agent Runtime turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffects {
    None,
    Filesystem,
    Network,
    Subprocess,
}

/// RPC connection scope (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Admin,
    Approvals,
    Pairing,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Read => "read",
            Scope::Write => "write",
            Scope::Admin => "admin",
            Scope::Approvals => "approvals",
            Scope::Pairing => "pairing",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Scope::Read),
            "write" => Ok(Scope::Write),
            "admin" => Ok(Scope::Admin),
            "approvals" => Ok(Scope::Approvals),
            "pairing" => Ok(Scope::Pairing),
            other => Err(format!("unknown scope: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_from_channel_is_stable() {
        let a = SessionId::from_channel("telegram", "123");
        let b = SessionId::from_channel("telegram", "123");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "telegram:123");
    }

    #[test]
    fn session_id_distinguishes_channels() {
        let tg = SessionId::from_channel("telegram", "123");
        let dc = SessionId::from_channel("discord", "123");
        assert_ne!(tg, dc);
    }

    #[test]
    fn scope_roundtrip() {
        for s in [Scope::Read, Scope::Write, Scope::Admin, Scope::Approvals, Scope::Pairing] {
            let parsed: Scope = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn importance_orders_low_to_high() {
        assert!(Importance::Low < Importance::Normal);
        assert!(Importance::Normal < Importance::High);
    }

    #[test]
    fn event_type_roundtrips_through_its_wire_spelling() {
        for t in EventType::ALL {
            let wire = serde_json::to_value(t).unwrap().as_str().unwrap().to_string();
            let parsed: EventType = wire.parse().unwrap();
            assert_eq!(parsed, *t);
        }
    }

    #[test]
    fn event_type_from_str_rejects_unknown_spellings() {
        assert!("NOT_A_REAL_EVENT".parse::<EventType>().is_err());
        assert!(EventType::try_from("not_a_real_event").is_err());
    }
}
