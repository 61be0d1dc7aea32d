//! Method registry (§4.9): names, scopes, and whether a method streams
//! `event` frames before its final `res`. Only `agent` and `chat.send` cause
//! an agent turn — everything else here is management.

use serde::{Deserialize, Serialize};

/// Minimum scope a connection must hold to invoke a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Read,
    Write,
    Admin,
    Approvals,
    Pairing,
}

/// One entry in the registry returned by `methods.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub scope: Scope,
    pub streams: bool,
}

pub const CONNECT: &str = "connect";
pub const METHODS_LIST: &str = "methods.list";

// turn-causing
pub const AGENT: &str = "agent";
pub const CHAT_SEND: &str = "chat.send";

// sessions
pub const SESSIONS_LIST: &str = "sessions.list";
pub const SESSIONS_GET: &str = "sessions.get";
pub const SESSIONS_DELETE: &str = "sessions.delete";

// channels
pub const CHANNELS_STATUS: &str = "channels.status";
pub const CHANNELS_START: &str = "channels.start";
pub const CHANNELS_STOP: &str = "channels.stop";
pub const CHANNELS_RESTART: &str = "channels.restart";

// config
pub const CONFIG_GET: &str = "config.get";
pub const CONFIG_SET: &str = "config.set";

// cron
pub const CRON_LIST: &str = "cron.list";
pub const CRON_ADD: &str = "cron.add";
pub const CRON_DELETE: &str = "cron.delete";
pub const CRON_SET_ENABLED: &str = "cron.set_enabled";

// health
pub const HEALTH_CHECK: &str = "health.check";

// logs
pub const LOGS_TAIL: &str = "logs.tail";

// approvals
pub const APPROVALS_LIST: &str = "approvals.list";
pub const APPROVALS_DECIDE: &str = "approvals.decide";

// pairing
pub const PAIRING_APPROVE: &str = "pairing.approve";

pub const REGISTRY: &[MethodDescriptor] = &[
    MethodDescriptor { name: AGENT, scope: Scope::Write, streams: true },
    MethodDescriptor { name: CHAT_SEND, scope: Scope::Write, streams: true },
    MethodDescriptor { name: SESSIONS_LIST, scope: Scope::Read, streams: false },
    MethodDescriptor { name: SESSIONS_GET, scope: Scope::Read, streams: false },
    MethodDescriptor { name: SESSIONS_DELETE, scope: Scope::Write, streams: false },
    MethodDescriptor { name: CHANNELS_STATUS, scope: Scope::Read, streams: false },
    MethodDescriptor { name: CHANNELS_START, scope: Scope::Admin, streams: false },
    MethodDescriptor { name: CHANNELS_STOP, scope: Scope::Admin, streams: false },
    MethodDescriptor { name: CHANNELS_RESTART, scope: Scope::Admin, streams: false },
    MethodDescriptor { name: CONFIG_GET, scope: Scope::Read, streams: false },
    MethodDescriptor { name: CONFIG_SET, scope: Scope::Admin, streams: false },
    MethodDescriptor { name: CRON_LIST, scope: Scope::Read, streams: false },
    MethodDescriptor { name: CRON_ADD, scope: Scope::Write, streams: false },
    MethodDescriptor { name: CRON_DELETE, scope: Scope::Write, streams: false },
    MethodDescriptor { name: CRON_SET_ENABLED, scope: Scope::Write, streams: false },
    MethodDescriptor { name: HEALTH_CHECK, scope: Scope::Read, streams: false },
    MethodDescriptor { name: LOGS_TAIL, scope: Scope::Admin, streams: false },
    MethodDescriptor { name: APPROVALS_LIST, scope: Scope::Approvals, streams: false },
    MethodDescriptor { name: APPROVALS_DECIDE, scope: Scope::Approvals, streams: false },
    MethodDescriptor { name: PAIRING_APPROVE, scope: Scope::Pairing, streams: false },
];

pub fn lookup(name: &str) -> Option<&'static MethodDescriptor> {
    REGISTRY.iter().find(|m| m.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn registry_names_are_unique() {
        let names: HashSet<&str> = REGISTRY.iter().map(|m| m.name).collect();
        assert_eq!(names.len(), REGISTRY.len());
    }

    #[test]
    fn only_agent_and_chat_send_stream() {
        let streaming: Vec<&str> = REGISTRY.iter().filter(|m| m.streams).map(|m| m.name).collect();
        assert_eq!(streaming, vec![AGENT, CHAT_SEND]);
    }

    #[test]
    fn lookup_finds_known_method() {
        assert_eq!(lookup(CONFIG_SET).unwrap().scope, Scope::Admin);
        assert!(lookup("nonexistent").is_none());
    }
}
