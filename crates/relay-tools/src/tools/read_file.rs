//! Tool: read_file — read the contents of a file from disk.

use async_trait::async_trait;
use relay_core::types::{PermissionClass, SideEffects};

use crate::registry::{Tool, ToolContext, ToolDescriptor, ToolResult};

const MAX_OUTPUT_CHARS: usize = 30_000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "read_file".to_string(),
            description: "Read the contents of a file. Optionally limit to a line range \
                with `offset` (1-based first line) and `limit` (number of lines)."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer"},
                    "limit": {"type": "integer"}
                },
                "required": ["path"]
            }),
            permission_class: PermissionClass::Safe,
            rate_limit: None,
            side_effects: SideEffects::Filesystem,
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::err("invalid_params", "missing required parameter: path");
        };
        let resolved = ctx.workspace_dir.join(path);
        let path = if resolved.exists() { resolved } else { std::path::PathBuf::from(path) };

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => return ToolResult::err("io_error", format!("failed to read '{}': {e}", path.display())),
        };

        let offset = input.get("offset").and_then(|v| v.as_u64()).map(|v| v.saturating_sub(1) as usize);
        let limit = input.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);

        let result = if offset.is_some() || limit.is_some() {
            let start = offset.unwrap_or(0);
            let lines: Vec<&str> = content.lines().skip(start).collect();
            let lines = if let Some(n) = limit { &lines[..n.min(lines.len())] } else { &lines[..] };
            lines.join("\n")
        } else {
            content
        };

        let result = if result.len() > MAX_OUTPUT_CHARS {
            format!("{}\n\n[output truncated at {} characters]", &result[..MAX_OUTPUT_CHARS], MAX_OUTPUT_CHARS)
        } else {
            result
        };

        ToolResult::ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::SessionId;
    use tokio_util::sync::CancellationToken;

    fn ctx(dir: std::path::PathBuf) -> ToolContext {
        ToolContext {
            session_id: SessionId::from("s1"),
            workspace_dir: dir,
            cancellation: CancellationToken::new(),
            permission_grant: PermissionClass::Admin,
        }
    }

    #[tokio::test]
    async fn reads_full_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\nworld").unwrap();
        let tool = ReadFileTool;
        let result = tool.execute(serde_json::json!({"path": "a.txt"}), &ctx(dir.path().to_path_buf())).await;
        assert!(result.is_ok());
        assert_eq!(result.value.unwrap(), "hello\nworld");
    }

    #[tokio::test]
    async fn missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool;
        let result = tool.execute(serde_json::json!({"path": "nope.txt"}), &ctx(dir.path().to_path_buf())).await;
        assert!(!result.is_ok());
    }
}
