//! Ordered policy chain for tool invocation (spec §4.3): allow-list,
//! deny-list, confirmation-required, then rate limit. The first step to
//! reach a non-`Allow` verdict short-circuits the chain.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relay_core::types::PermissionClass;

use crate::registry::{ToolContext, ToolDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
    /// Confirmation required; the Agent Runtime must suspend the turn and
    /// resolve via the Gateway RPC approvals method before retrying.
    Pending,
}

struct RateLimiter {
    max_calls: u32,
    per: Duration,
    // (session_id, tool_name) -> call timestamps within the current window
    hits: DashMap<(String, String), Mutex<Vec<Instant>>>,
}

impl RateLimiter {
    fn check(&self, session_id: &str, tool: &str) -> bool {
        self.check_with(session_id, tool, self.max_calls, self.per)
    }

    fn check_with(&self, session_id: &str, tool: &str, max_calls: u32, per: Duration) -> bool {
        let key = (session_id.to_string(), tool.to_string());
        let entry = self.hits.entry(key).or_insert_with(|| Mutex::new(Vec::new()));
        let mut hits = entry.lock().unwrap();
        let now = Instant::now();
        hits.retain(|t| now.duration_since(*t) < per);
        if hits.len() as u32 >= max_calls {
            false
        } else {
            hits.push(now);
            true
        }
    }
}

/// Ordered chain of allow-list, deny-list, confirmation-required, rate
/// limit. Callers build one per `RuntimeEnv`.
pub struct PolicyChain {
    allow_list: Option<HashSet<String>>,
    deny_list: HashSet<String>,
    confirmation_required: HashSet<String>,
    max_permission: PermissionClass,
    limiter: RateLimiter,
}

impl PolicyChain {
    /// A permissive chain used in tests and for admin environments: no
    /// allow-list restriction, nothing denied, nothing gated, unlimited rate.
    pub fn allow_all() -> Self {
        Self {
            allow_list: None,
            deny_list: HashSet::new(),
            confirmation_required: HashSet::new(),
            max_permission: PermissionClass::Admin,
            limiter: RateLimiter { max_calls: u32::MAX, per: Duration::from_secs(1), hits: DashMap::new() },
        }
    }

    pub fn new(
        allow_list: Option<HashSet<String>>,
        deny_list: HashSet<String>,
        confirmation_required: HashSet<String>,
        max_permission: PermissionClass,
        default_rate_limit: (u32, u64),
    ) -> Self {
        Self {
            allow_list,
            deny_list,
            confirmation_required,
            max_permission,
            limiter: RateLimiter {
                max_calls: default_rate_limit.0,
                per: Duration::from_secs(default_rate_limit.1),
                hits: DashMap::new(),
            },
        }
    }

    pub fn check(&self, descriptor: &ToolDescriptor, ctx: &ToolContext) -> PolicyDecision {
        if let Some(allow) = &self.allow_list {
            if !allow.contains(&descriptor.name) {
                return PolicyDecision::Deny(format!("{} is not on the allow-list", descriptor.name));
            }
        }

        if self.deny_list.contains(&descriptor.name) {
            return PolicyDecision::Deny(format!("{} is on the deny-list", descriptor.name));
        }

        if descriptor.permission_class > self.max_permission {
            return PolicyDecision::Deny(format!(
                "{} requires {:?}, caller grants {:?}",
                descriptor.name, descriptor.permission_class, ctx.permission_grant
            ));
        }

        if self.confirmation_required.contains(&descriptor.name) {
            return PolicyDecision::Pending;
        }

        let (max_calls, per) = descriptor
            .rate_limit
            .map(|r| (r.max_calls, Duration::from_secs(r.per_secs)))
            .unwrap_or((self.limiter.max_calls, self.limiter.per));
        if !self.limiter.check_with(ctx.session_id.as_str(), &descriptor.name, max_calls, per) {
            return PolicyDecision::Deny(format!("{} rate limit exceeded", descriptor.name));
        }

        PolicyDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolDescriptor;
    use relay_core::types::{SessionId, SideEffects};
    use tokio_util::sync::CancellationToken;

    fn descriptor(name: &str, class: PermissionClass) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({}),
            permission_class: class,
            rate_limit: None,
            side_effects: SideEffects::None,
        }
    }

    fn ctx(grant: PermissionClass) -> ToolContext {
        ToolContext {
            session_id: SessionId::from("s1"),
            workspace_dir: std::env::temp_dir(),
            cancellation: CancellationToken::new(),
            permission_grant: grant,
        }
    }

    #[test]
    fn deny_list_blocks() {
        let chain = PolicyChain::new(
            None,
            HashSet::from(["danger".to_string()]),
            HashSet::new(),
            PermissionClass::Admin,
            (100, 60),
        );
        let d = chain.check(&descriptor("danger", PermissionClass::Safe), &ctx(PermissionClass::Admin));
        assert_eq!(d, PolicyDecision::Deny("danger is on the deny-list".to_string()));
    }

    #[test]
    fn permission_above_grant_is_denied() {
        let chain = PolicyChain::allow_all_but_admin();
        let d = chain.check(&descriptor("reboot", PermissionClass::Admin), &ctx(PermissionClass::Safe));
        assert!(matches!(d, PolicyDecision::Deny(_)));
    }

    #[test]
    fn confirmation_required_tool_is_pending() {
        let chain = PolicyChain::new(
            None,
            HashSet::new(),
            HashSet::from(["send_money".to_string()]),
            PermissionClass::Admin,
            (100, 60),
        );
        let d = chain.check(&descriptor("send_money", PermissionClass::Gated), &ctx(PermissionClass::Admin));
        assert_eq!(d, PolicyDecision::Pending);
    }

    impl PolicyChain {
        fn allow_all_but_admin() -> Self {
            PolicyChain::new(None, HashSet::new(), HashSet::new(), PermissionClass::Gated, (100, 60))
        }
    }
}
