use serde::{Deserialize, Serialize};

/// A platform update normalized into the gateway's shape (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel_id: String,
    pub sender_id: String,
    pub chat_id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Opaque platform-native reference (e.g. the raw update id), carried
    /// through for adapters that need it on reply.
    #[serde(default)]
    pub native_ref: Option<serde_json::Value>,
}

/// A message to deliver to an external channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub chat_id: String,
    pub text: String,
    #[serde(default)]
    pub format: MessageFormat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    #[default]
    PlainText,
    Markdown,
    Html,
}

/// A generated file to deliver via `send_media`. Field-for-field compatible
/// with `relay_tools::GeneratedFile`'s JSON shape — the channel layer never
/// depends on `relay-tools` directly, it just decodes the `AGENT_FILE_GENERATED`
/// event payload the Agent Runtime already publishes in that shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub path: String,
    pub media_type: String,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Result of an adapter's own connectivity self-check (§4.6 `check_health`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub healthy: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ChannelHealth {
    pub fn ok() -> Self {
        Self { healthy: true, detail: None }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self { healthy: false, detail: Some(detail.into()) }
    }
}
