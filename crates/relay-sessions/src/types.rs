use std::path::PathBuf;

use chrono::{DateTime, Utc};
use relay_core::types::{Message, SessionId};
use serde::{Deserialize, Serialize};

/// A durable conversation identity with its own append-only message log.
///
/// Invariants (enforced by [`crate::store::SessionStore`], not this type
/// alone): the first message, if present, is `system` or `user`; every
/// `tool` message is preceded by a matching tool call; the token-estimate
/// sum is within `max_context_tokens` immediately after any compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub workspace_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    /// Produced by compaction step 4; replaces the prior summary each time
    /// the live history is summarized, rather than accumulating.
    #[serde(default)]
    pub summary: Option<String>,
}

impl Session {
    pub fn new(session_id: SessionId, workspace_dir: PathBuf) -> Self {
        Self { session_id, workspace_dir, created_at: Utc::now(), messages: Vec::new(), summary: None }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }
}
