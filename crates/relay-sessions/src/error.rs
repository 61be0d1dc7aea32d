use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("io error persisting session {session_id}: {source}")]
    Io { session_id: String, #[source] source: std::io::Error },

    #[error("malformed session file {session_id}: {source}")]
    Corrupt { session_id: String, #[source] source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, SessionError>;
