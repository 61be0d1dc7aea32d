use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::delta::ChatDelta;

/// Classification of a provider's authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    ApiKey,
    OAuth,
    Exchange,
    None,
}

/// Snapshot of a provider's current authentication state.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub token_type: TokenType,
    pub expires_at: Option<i64>,
    pub refreshable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Rendered system prompt content for a request. `CacheTiered` carries
/// provider-native cache breakpoints (Anthropic content blocks); providers
/// that don't support caching fall back to flattening it.
#[derive(Debug, Clone)]
pub enum SystemContent {
    Plain(String),
    CacheTiered(Vec<serde_json::Value>),
}

impl SystemContent {
    pub fn flatten(&self) -> String {
        match self {
            SystemContent::Plain(s) => s.clone(),
            SystemContent::CacheTiered(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// Options controlling one `stream_chat` call.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Hint the model should reason before answering, where the provider
    /// supports it. Ignored by providers without a thinking mode.
    pub thinking: bool,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: SystemContent,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub options: ChatOptions,
}

/// Common interface for LLM providers (§4.4). Implementations live outside
/// this crate; this crate owns the contract, the router, and test doubles.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Stream a chat response. Deltas are pushed to `tx` as they arrive;
    /// the returned `Result` reports only failures discovered before (or
    /// instead of) producing any delta — mid-stream failures are signalled
    /// in-band as `ChatDelta::ProviderError`.
    async fn stream_chat(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<ChatDelta>,
    ) -> Result<(), ProviderError>;

    /// Return current authentication state. Providers without tokens return `None`.
    fn token_info(&self) -> Option<TokenInfo> {
        None
    }

    /// Attempt to refresh authentication credentials. No-op by default.
    async fn refresh_auth(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("model overloaded")]
    Overloaded,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether retrying the same credential against the same model is worth
    /// attempting. Auth failures are not — they go on cool-down instead.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_)
                | ProviderError::Api { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Overloaded
                | ProviderError::Unavailable(_)
        )
    }

    pub fn kind(&self) -> crate::delta::ProviderErrorKind {
        use crate::delta::ProviderErrorKind as K;
        match self {
            ProviderError::RateLimited { .. } => K::RateLimited,
            ProviderError::Overloaded => K::Overloaded,
            ProviderError::Auth(_) => K::Auth,
            ProviderError::Cancelled => K::Cancelled,
            ProviderError::Parse(_) => K::Parse,
            ProviderError::Transport(_) | ProviderError::Api { .. } | ProviderError::Unavailable(_) => {
                K::Transport
            }
        }
    }
}
