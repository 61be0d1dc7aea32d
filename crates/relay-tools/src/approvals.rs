//! Store for tool calls suspended on a confirmation-required policy decision
//! (spec §4.3). `ToolRegistry::invoke` parks the call here and awaits the
//! paired receiver; the Gateway's `approvals.list`/`approvals.decide` RPC
//! methods read and resolve entries through this same store.

use std::sync::Mutex;

use dashmap::DashMap;
use relay_core::types::SessionId;
use serde::Serialize;
use tokio::sync::oneshot;

/// A suspended tool call, as surfaced to an operator deciding on it.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub requested_at: chrono::DateTime<chrono::Utc>,
}

struct Entry {
    approval: PendingApproval,
    resolve: Mutex<Option<oneshot::Sender<bool>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("no pending approval with id '{0}'")]
    NotFound(String),
}

/// Pending tool-call approvals, keyed by a generated id. One store is shared
/// across every `RuntimeEnv`'s `ToolRegistry` so the Gateway's RPC surface
/// can decide on an approval without knowing which environment raised it.
#[derive(Default)]
pub struct ApprovalStore {
    pending: DashMap<String, Entry>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self { pending: DashMap::new() }
    }

    /// Register a suspended call and return its id plus the receiver the
    /// caller should await. Dropping the receiver without a `decide()` call
    /// (e.g. the caller cancelled) leaves the entry in the store; callers
    /// should `cancel()` it themselves on that path.
    pub(crate) fn create(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> (String, oneshot::Receiver<bool>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            Entry {
                approval: PendingApproval {
                    id: id.clone(),
                    session_id: session_id.to_string(),
                    tool_name: tool_name.to_string(),
                    arguments,
                    requested_at: chrono::Utc::now(),
                },
                resolve: Mutex::new(Some(tx)),
            },
        );
        (id, rx)
    }

    pub(crate) fn cancel(&self, id: &str) {
        self.pending.remove(id);
    }

    pub fn list(&self) -> Vec<PendingApproval> {
        self.pending.iter().map(|e| e.approval.clone()).collect()
    }

    /// Resolve a pending approval, waking the `invoke()` call that's parked
    /// on it. Removes the entry either way so a second `decide()` on the
    /// same id fails with `NotFound` rather than silently no-op'ing.
    pub fn decide(&self, id: &str, approve: bool) -> Result<(), ApprovalError> {
        let (_, entry) = self.pending.remove(id).ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        let sender = entry.resolve.lock().expect("approval mutex never poisoned by a panic").take();
        match sender {
            Some(tx) => {
                let _ = tx.send(approve);
                Ok(())
            }
            None => Err(ApprovalError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decide_wakes_the_waiting_receiver() {
        let store = ApprovalStore::new();
        let (id, rx) = store.create(&SessionId::from("s1"), "send_money", serde_json::json!({"amount": 5}));
        assert_eq!(store.list().len(), 1);

        store.decide(&id, true).unwrap();
        assert_eq!(rx.await.unwrap(), true);
        assert!(store.list().is_empty());
    }

    #[test]
    fn deciding_unknown_id_errors() {
        let store = ApprovalStore::new();
        assert!(matches!(store.decide("nope", true), Err(ApprovalError::NotFound(_))));
    }

    #[test]
    fn deciding_twice_errors_the_second_time() {
        let store = ApprovalStore::new();
        let (id, _rx) = store.create(&SessionId::from("s1"), "t", serde_json::json!({}));
        store.decide(&id, false).unwrap();
        assert!(matches!(store.decide(&id, true), Err(ApprovalError::NotFound(_))));
    }
}
