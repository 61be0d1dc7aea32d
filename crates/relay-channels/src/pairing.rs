//! DM pairing store (§4.6): one JSON file per channel under
//! `workspace/.pairing/<channel_id>.json`, holding an allow-list of approved
//! senders and the short codes issued to senders still waiting on operator
//! approval. Persistence reuses the same debounced write-behind primitive as
//! `relay-sessions`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::persist::{self, DebouncedWriter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const DEBOUNCE: Duration = Duration::from_millis(200);
/// Codes older than this are no longer accepted by `approve` and are swept
/// by `prune_expired`.
const CODE_TTL_SECS: i64 = 900;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PairingFile {
    allowed: HashMap<String, AllowedSender>,
    pending: HashMap<String, PendingCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AllowedSender {
    approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingCode {
    sender_id: String,
    created_at: DateTime<Utc>,
}

/// Per-channel allow-list of senders permitted to open a DM when that
/// channel's `dm_policy` is `pairing`.
pub struct PairingStore {
    writer: DebouncedWriter,
    file: Mutex<PairingFile>,
}

impl PairingStore {
    pub fn new(workspace_dir: &Path, channel_id: &str) -> Self {
        let path: PathBuf = workspace_dir.join(".pairing").join(format!("{channel_id}.json"));
        let file = persist::read_json::<PairingFile>(&path).ok().flatten().unwrap_or_default();
        Self { writer: DebouncedWriter::new(path, DEBOUNCE), file: Mutex::new(file) }
    }

    pub async fn is_allowed(&self, sender_id: &str) -> bool {
        self.file.lock().await.allowed.contains_key(sender_id)
    }

    /// Issue a pairing code for `sender_id`, reusing one already pending.
    pub async fn request_code(&self, sender_id: &str) -> String {
        let mut file = self.file.lock().await;
        if let Some((code, _)) = file.pending.iter().find(|(_, p)| p.sender_id == sender_id) {
            return code.clone();
        }
        let code = generate_code();
        file.pending.insert(code.clone(), PendingCode { sender_id: sender_id.to_string(), created_at: Utc::now() });
        self.writer.schedule(file.clone());
        code
    }

    /// Operator approval (`pairing.approve` RPC): moves the code's sender
    /// onto the allow-list. Returns the approved sender id, or `None` if the
    /// code is unknown or expired.
    pub async fn approve(&self, code: &str) -> Option<String> {
        let mut file = self.file.lock().await;
        let pending = file.pending.remove(code)?;
        if Utc::now().signed_duration_since(pending.created_at).num_seconds() >= CODE_TTL_SECS {
            self.writer.schedule(file.clone());
            return None;
        }
        file.allowed.insert(pending.sender_id.clone(), AllowedSender { approved_at: Utc::now() });
        self.writer.schedule(file.clone());
        Some(pending.sender_id)
    }

    pub async fn prune_expired(&self) {
        let mut file = self.file.lock().await;
        let now = Utc::now();
        let before = file.pending.len();
        file.pending.retain(|_, p| now.signed_duration_since(p.created_at).num_seconds() < CODE_TTL_SECS);
        if file.pending.len() != before {
            self.writer.schedule(file.clone());
        }
    }
}

/// Six-digit numeric code derived from the current monotonic nanosecond
/// offset — avoids a `rand` dependency the same way the reconnect jitter
/// does in `manager.rs`.
fn generate_code() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:06}", nanos % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_sender_is_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::new(dir.path(), "telegram");
        assert!(!store.is_allowed("user-1").await);
    }

    #[tokio::test]
    async fn request_code_is_stable_for_the_same_sender() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::new(dir.path(), "telegram");
        let a = store.request_code("user-1").await;
        let b = store.request_code("user-1").await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn approve_moves_sender_to_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::new(dir.path(), "telegram");
        let code = store.request_code("user-1").await;

        let approved = store.approve(&code).await;
        assert_eq!(approved.as_deref(), Some("user-1"));
        assert!(store.is_allowed("user-1").await);
    }

    #[tokio::test]
    async fn approve_rejects_unknown_code() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::new(dir.path(), "telegram");
        assert!(store.approve("000000").await.is_none());
    }
}
