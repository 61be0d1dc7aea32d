//! Session Store (§4.2): `get_or_create`, `append`, `snapshot`, `delete`,
//! `list`, backed by one JSON file per session under `workspace/.sessions/`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relay_core::persist::{self, DebouncedWriter};
use relay_core::types::{Message, SessionId};
use tokio::sync::Mutex as AsyncMutex;

use crate::compact::{compact, CompactedView, CompactionBudget, Summarizer};
use crate::error::{Result, SessionError};
use crate::types::Session;

const DEBOUNCE: Duration = Duration::from_millis(200);

struct Entry {
    session: AsyncMutex<Session>,
    writer: DebouncedWriter,
}

/// In-memory session cache with debounced JSON-file persistence. One
/// `SessionStore` instance serves every session within a workspace.
pub struct SessionStore {
    workspace_dir: PathBuf,
    entries: DashMap<SessionId, Arc<Entry>>,
}

impl SessionStore {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir, entries: DashMap::new() }
    }

    fn session_path(&self, session_id: &SessionId) -> PathBuf {
        self.workspace_dir.join(".sessions").join(format!("{session_id}.json"))
    }

    fn entry(&self, session_id: &SessionId) -> Arc<Entry> {
        if let Some(e) = self.entries.get(session_id) {
            return e.clone();
        }
        let path = self.session_path(session_id);
        let session = persist::read_json::<Session>(&path)
            .ok()
            .flatten()
            .unwrap_or_else(|| Session::new(session_id.clone(), self.workspace_dir.clone()));
        let entry = Arc::new(Entry {
            session: AsyncMutex::new(session),
            writer: DebouncedWriter::new(path, DEBOUNCE),
        });
        self.entries.insert(session_id.clone(), entry.clone());
        entry
    }

    /// Return the session for `session_id`, creating it on first access.
    pub async fn get_or_create(&self, session_id: &SessionId) -> Session {
        let entry = self.entry(session_id);
        let session = entry.session.lock().await.clone();
        session
    }

    /// Append `message` to the session's live history and schedule a
    /// debounced persist.
    pub async fn append(&self, session_id: &SessionId, message: Message) {
        let entry = self.entry(session_id);
        let mut session = entry.session.lock().await;
        session.append(message);
        entry.writer.schedule(session.clone());
    }

    /// The full, uncompacted live history.
    pub async fn snapshot(&self, session_id: &SessionId) -> Vec<Message> {
        self.entry(session_id).session.lock().await.messages.clone()
    }

    /// Compacted view of the session suitable for injection into a turn's
    /// prompt (§4.2). Does not mutate the persisted log, except that a new
    /// summary produced by step 4 is written back immediately so repeated
    /// calls within the same turn stay idempotent.
    pub async fn compacted_view(
        &self,
        session_id: &SessionId,
        budget: CompactionBudget,
        summarizer: &dyn Summarizer,
    ) -> CompactedView {
        let entry = self.entry(session_id);
        let mut session = entry.session.lock().await;
        let view = compact(&session, budget, summarizer);
        if let Some(new_summary) = &view.new_summary {
            if session.summary.as_deref() != Some(new_summary.as_str()) {
                session.summary = Some(new_summary.clone());
                entry.writer.schedule(session.clone());
            }
        }
        CompactedView { messages: view.messages, new_summary: session.summary.clone() }
    }

    pub async fn delete(&self, session_id: &SessionId) -> Result<()> {
        if self.entries.remove(session_id).is_none() {
            let path = self.session_path(session_id);
            if !path.exists() {
                return Err(SessionError::NotFound { session_id: session_id.to_string() });
            }
        }
        let path = self.session_path(session_id);
        tokio::fs::remove_file(&path)
            .await
            .or_else(|e| if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) })
            .map_err(|source| SessionError::Io { session_id: session_id.to_string(), source })
    }

    /// Known session ids: whatever is cached in memory plus whatever is on
    /// disk under `workspace/.sessions/`.
    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: std::collections::HashSet<SessionId> =
            self.entries.iter().map(|e| e.key().clone()).collect();

        let dir = self.workspace_dir.join(".sessions");
        if let Ok(read_dir) = std::fs::read_dir(&dir) {
            for entry in read_dir.flatten() {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    ids.insert(SessionId::from(stem));
                }
            }
        }
        ids.into_iter().collect()
    }

    /// Force an immediate flush of every cached session, bypassing debounce.
    /// Called on graceful shutdown.
    pub async fn flush_all(&self) {
        for entry in self.entries.iter() {
            let session = entry.value().session.lock().await;
            if let Err(e) = entry.value().writer.flush_now(&*session).await {
                tracing::warn!(session_id = %entry.key(), error = %e, "failed to flush session on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::{Importance, Role};

    struct NoopSummarizer;
    impl Summarizer for NoopSummarizer {
        fn summarize(&self, _dropped_prefix: &str) -> String {
            "summary".to_string()
        }
    }

    fn text_message(role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_string(),
            tool_calls: Vec::new(),
            tool_result: None,
            timestamp: chrono::Utc::now(),
            token_estimate: content.len() as u32 / 4 + 1,
            importance: Importance::Normal,
        }
    }

    #[tokio::test]
    async fn get_or_create_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let id = SessionId::from("telegram:1");

        store.append(&id, text_message(Role::User, "hello")).await;
        let session = store.get_or_create(&id).await;
        assert_eq!(session.messages.len(), 1);
    }

    #[tokio::test]
    async fn append_persists_to_disk_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let id = SessionId::from("telegram:2");

        store.append(&id, text_message(Role::User, "hi")).await;
        tokio::time::sleep(Duration::from_millis(350)).await;

        let path = dir.path().join(".sessions").join("telegram:2.json");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let id = SessionId::from("telegram:3");
        store.append(&id, text_message(Role::User, "hi")).await;

        store.delete(&id).await.unwrap();
        assert!(store.delete(&id).await.is_err());
    }

    #[tokio::test]
    async fn compacted_view_under_budget_matches_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let id = SessionId::from("telegram:4");
        store.append(&id, text_message(Role::User, "hi")).await;

        let view = store
            .compacted_view(&id, CompactionBudget { max_context_tokens: 10_000, keep_recent: 10 }, &NoopSummarizer)
            .await;
        assert_eq!(view.messages.len(), 1);
    }
}
