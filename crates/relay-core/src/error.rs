use thiserror::Error;

/// Root error taxonomy for the gateway. Downstream crates define narrower
/// error enums (`SessionError`, `ChannelError`, `ProviderError`,
/// `SchedulerError`, ...) and convert into this one at the boundary.
///
/// `code()` returns the stable string sent to clients in `res error` frames
/// (spec §6) or used to classify internal handling policy (spec §7).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("session busy: {session_id}")]
    SessionBusy { session_id: String },

    #[error("channel unavailable: {channel_id}")]
    ChannelUnavailable { channel_id: String },

    #[error("tool denied: {tool} ({reason})")]
    ToolDenied { tool: String, reason: String },

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("auth error: {0}")]
    AuthError(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("timeout after {ms}ms")]
    Timeout { ms: u64 },
}

impl RelayError {
    /// Stable error code, matching spec §6's required set where applicable.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config_error",
            RelayError::Forbidden { .. } => "forbidden",
            RelayError::NotConnected => "not_connected",
            RelayError::UnknownMethod { .. } => "unknown_method",
            RelayError::InvalidParams(_) => "invalid_params",
            RelayError::SessionBusy { .. } => "session_busy",
            RelayError::ChannelUnavailable { .. } => "channel_unavailable",
            RelayError::ToolDenied { .. } => "tool_denied",
            RelayError::ProviderError(_) => "provider_error",
            RelayError::AuthError(_) => "auth_error",
            RelayError::Internal(_) => "internal_error",
            RelayError::Serialization(_) => "serialization_error",
            RelayError::Io(_) => "io_error",
            RelayError::PayloadTooLarge { .. } => "payload_too_large",
            RelayError::Timeout { .. } => "timeout",
        }
    }

    /// Whether a client may retry the operation that failed with this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            RelayError::ProviderError(_) | RelayError::Timeout { .. } | RelayError::ChannelUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_rpc_taxonomy() {
        assert_eq!(RelayError::Forbidden { reason: "x".into() }.code(), "forbidden");
        assert_eq!(RelayError::NotConnected.code(), "not_connected");
        assert_eq!(
            RelayError::UnknownMethod { method: "x".into() }.code(),
            "unknown_method"
        );
        assert_eq!(
            RelayError::SessionBusy { session_id: "s1".into() }.code(),
            "session_busy"
        );
        assert_eq!(
            RelayError::ChannelUnavailable { channel_id: "c1".into() }.code(),
            "channel_unavailable"
        );
        assert_eq!(
            RelayError::ToolDenied { tool: "t".into(), reason: "r".into() }.code(),
            "tool_denied"
        );
        assert_eq!(RelayError::ProviderError("x".into()).code(), "provider_error");
    }
}
