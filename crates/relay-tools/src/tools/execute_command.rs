//! Tool: execute_command — one-shot shell command execution.
//!
//! Runs the command via `sh -c` under a wall-clock timeout. A small
//! built-in denylist blocks obviously destructive commands in addition to
//! whatever the policy chain enforces at the registry level.

use std::time::Duration;

use async_trait::async_trait;
use relay_core::types::{PermissionClass, SideEffects};
use tokio::process::Command;

use crate::registry::{Tool, ToolContext, ToolDescriptor, ToolResult};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DENYLIST: &[&str] = &["rm -rf /", "mkfs", ":(){ :|:& };:"];

pub struct ExecuteCommandTool;

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "execute_command".to_string(),
            description: "Execute a shell command and return stdout/stderr. \
                Blocked if it matches an obviously destructive pattern. Default timeout 30s."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            }),
            permission_class: PermissionClass::Gated,
            rate_limit: None,
            side_effects: SideEffects::Subprocess,
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::err("invalid_params", "missing required parameter: command");
        };

        if DENYLIST.iter().any(|d| command.contains(d)) {
            return ToolResult::err("blocked", "command matches a blocked pattern");
        }

        let fut = Command::new("sh").arg("-c").arg(command).current_dir(&ctx.workspace_dir).output();

        let output = tokio::select! {
            result = tokio::time::timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS), fut) => result,
            _ = ctx.cancellation.cancelled() => return ToolResult::err("cancelled", "command cancelled"),
        };

        match output {
            Ok(Ok(out)) => {
                let mut text = String::new();
                text.push_str(&String::from_utf8_lossy(&out.stdout));
                if !out.stderr.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str("[stderr]\n");
                    text.push_str(&String::from_utf8_lossy(&out.stderr));
                }
                if !out.status.success() {
                    text.push_str(&format!("\n[exit code: {}]", out.status.code().unwrap_or(-1)));
                }
                if text.is_empty() {
                    text = "(no output)".to_string();
                }
                ToolResult::ok(text)
            }
            Ok(Err(e)) => ToolResult::err("spawn_error", e.to_string()),
            Err(_) => ToolResult::err("timeout", format!("command exceeded {DEFAULT_TIMEOUT_SECS}s")),
        }
    }
}
