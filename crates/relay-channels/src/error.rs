use thiserror::Error;

/// Errors a channel adapter can raise from any lifecycle hook or send call.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("configuration error: {0}")]
    ConfigError(String),
}
