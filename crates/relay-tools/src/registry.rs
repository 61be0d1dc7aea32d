//! Tool trait, descriptor, invocation contract and registry.
//!
//! Extends a plain `Tool`/`ToolResult` shape with the descriptor fields and
//! richer result contract §4.3 requires.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::types::{PermissionClass, SessionId, SideEffects};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::approvals::ApprovalStore;

/// A file a tool produced as a side effect of running, to be delivered to
/// the originating channel via `send_media` (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub media_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Outcome of a tool invocation: `{ok: true, value}` or
/// `{ok: false, kind, message}`, plus an optional generated-file signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_file: Option<GeneratedFile>,
}

impl ToolResult {
    pub fn ok(value: impl Serialize) -> Self {
        Self {
            ok: true,
            value: Some(serde_json::to_value(value).unwrap_or(serde_json::Value::Null)),
            kind: None,
            message: None,
            generated_file: None,
        }
    }

    pub fn ok_with_file(value: impl Serialize, file: GeneratedFile) -> Self {
        Self {
            ok: true,
            value: Some(serde_json::to_value(value).unwrap_or(serde_json::Value::Null)),
            kind: None,
            message: None,
            generated_file: Some(file),
        }
    }

    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { ok: false, value: None, kind: Some(kind.into()), message: Some(message.into()), generated_file: None }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool denied: {0}")]
    Denied(String),
    #[error("tool timed out")]
    Timeout,
    #[error("tool cancelled")]
    Cancelled,
}

/// Context passed to every tool invocation (spec §4.3).
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub workspace_dir: std::path::PathBuf,
    pub cancellation: CancellationToken,
    pub permission_grant: PermissionClass,
}

/// Static metadata about a registered tool, independent of its invoker.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub permission_class: PermissionClass,
    pub rate_limit: Option<RateLimit>,
    pub side_effects: SideEffects,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_calls: u32,
    pub per_secs: u64,
}

/// Trait every tool implements. `descriptor()` is static; `execute` does
/// the work against a particular `ToolContext`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> ToolResult;
}

/// Catalog of callable tools plus the ordered policy chain from `policy.rs`.
///
/// Mutations (`register`) take the registry-wide write lock implicit in
/// `DashMap`; reads (`list`, `invoke`) don't block each other, matching the
/// "read-mostly, registry-wide write lock on mutation" resource policy of
/// spec §5.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
    policy: crate::policy::PolicyChain,
    approvals: Arc<ApprovalStore>,
}

impl ToolRegistry {
    pub fn new(policy: crate::policy::PolicyChain) -> Self {
        Self { tools: DashMap::new(), policy, approvals: Arc::new(ApprovalStore::new()) }
    }

    /// The pending-approvals store tool calls suspend into when the policy
    /// chain returns `Pending`. Callers share a single `ApprovalStore`
    /// across every `RuntimeEnv`'s registry (see the Gateway's bootstrap) so
    /// the `approvals.list`/`approvals.decide` RPC methods don't need to know
    /// which environment raised a given call.
    pub fn approvals(&self) -> Arc<ApprovalStore> {
        self.approvals.clone()
    }

    /// Build a registry that shares an existing `ApprovalStore` rather than
    /// starting its own, empty one.
    pub fn with_approvals(policy: crate::policy::PolicyChain, approvals: Arc<ApprovalStore>) -> Self {
        Self { tools: DashMap::new(), policy, approvals }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name;
        self.tools.insert(name, tool);
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|e| e.value().descriptor()).collect()
    }

    pub fn describe_for_provider(&self) -> Vec<serde_json::Value> {
        self.list()
            .into_iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "description": d.description,
                    "input_schema": d.input_schema,
                })
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| e.value().clone())
    }

    /// Invoke a tool by name, running it through the policy chain first. A
    /// confirmation-required policy step parks the call in the approval
    /// store and suspends here — not in the Agent Runtime's turn loop — by
    /// awaiting the paired receiver; `invoke()` only returns once an
    /// `approvals.decide` RPC call resolves it (approved, denied, or the
    /// context is cancelled first). The Agent Runtime sees this as one long
    /// `invoke()` call, same as a slow tool; it doesn't need its own notion
    /// of a suspended state.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let descriptor = tool.descriptor();

        match self.policy.check(&descriptor, ctx) {
            crate::policy::PolicyDecision::Allow => {}
            crate::policy::PolicyDecision::Deny(reason) => return Err(ToolError::Denied(reason)),
            crate::policy::PolicyDecision::Pending => {
                let (id, rx) = self.approvals.create(&ctx.session_id, name, arguments.clone());
                tracing::info!(approval_id = %id, tool = name, session_id = %ctx.session_id, "tool call suspended pending approval");
                let approved = tokio::select! {
                    res = rx => res.unwrap_or(false),
                    _ = ctx.cancellation.cancelled() => {
                        self.approvals.cancel(&id);
                        return Err(ToolError::Cancelled);
                    }
                };
                if !approved {
                    return Err(ToolError::Denied(format!("{name} was not approved")));
                }
            }
        }

        if ctx.cancellation.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        Ok(tool.execute(arguments, ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::PermissionClass as PC;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "echo".to_string(),
                description: "echoes input".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
                permission_class: PC::Safe,
                rate_limit: None,
                side_effects: SideEffects::None,
            }
        }

        async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok(input)
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::from("s1"),
            workspace_dir: std::env::temp_dir(),
            cancellation: CancellationToken::new(),
            permission_grant: PC::Admin,
        }
    }

    #[tokio::test]
    async fn invoke_unknown_tool_errors() {
        let reg = ToolRegistry::new(crate::policy::PolicyChain::allow_all());
        let err = reg.invoke("nope", serde_json::Value::Null, &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn invoke_registered_tool_succeeds() {
        let reg = ToolRegistry::new(crate::policy::PolicyChain::allow_all());
        reg.register(Arc::new(Echo));
        let result = reg.invoke("echo", serde_json::json!({"x": 1}), &ctx()).await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancelled_context_denies_invocation() {
        let reg = ToolRegistry::new(crate::policy::PolicyChain::allow_all());
        reg.register(Arc::new(Echo));
        let mut c = ctx();
        c.cancellation.cancel();
        let err = reg.invoke("echo", serde_json::Value::Null, &c).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    fn confirmation_required_chain() -> crate::policy::PolicyChain {
        crate::policy::PolicyChain::new(
            None,
            std::collections::HashSet::new(),
            std::collections::HashSet::from(["echo".to_string()]),
            PC::Admin,
            (100, 60),
        )
    }

    #[tokio::test]
    async fn pending_tool_call_suspends_until_approved() {
        let reg = Arc::new(ToolRegistry::new(confirmation_required_chain()));
        reg.register(Arc::new(Echo));

        let approvals = reg.approvals();
        let invoking = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.invoke("echo", serde_json::json!({"x": 1}), &ctx()).await })
        };

        // Give invoke() a moment to park the call before deciding on it.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let pending = approvals.list();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_name, "echo");

        approvals.decide(&pending[0].id, true).unwrap();
        let result = invoking.await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(approvals.list().is_empty());
    }

    #[tokio::test]
    async fn rejected_approval_denies_the_call() {
        let reg = Arc::new(ToolRegistry::new(confirmation_required_chain()));
        reg.register(Arc::new(Echo));

        let approvals = reg.approvals();
        let invoking = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.invoke("echo", serde_json::Value::Null, &ctx()).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let id = approvals.list().remove(0).id;
        approvals.decide(&id, false).unwrap();

        let err = invoking.await.unwrap().unwrap_err();
        assert!(matches!(err, ToolError::Denied(_)));
    }

    #[tokio::test]
    async fn cancelling_while_pending_removes_the_approval() {
        let reg = Arc::new(ToolRegistry::new(confirmation_required_chain()));
        reg.register(Arc::new(Echo));

        let approvals = reg.approvals();
        let cancellation = CancellationToken::new();
        let mut c = ctx();
        c.cancellation = cancellation.clone();
        let invoking = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.invoke("echo", serde_json::Value::Null, &c).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancellation.cancel();

        let err = invoking.await.unwrap().unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
        assert!(approvals.list().is_empty());
    }
}
