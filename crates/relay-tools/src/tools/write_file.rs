//! Tool: write_file — write content to a file, creating parent directories as needed.

use async_trait::async_trait;
use relay_core::types::{PermissionClass, SideEffects};

use crate::registry::{Tool, ToolContext, ToolDescriptor, ToolResult};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "write_file".to_string(),
            description: "Write content to a file, creating parent directories as needed. \
                Overwrites the file if it already exists."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
            permission_class: PermissionClass::Gated,
            rate_limit: None,
            side_effects: SideEffects::Filesystem,
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::err("invalid_params", "missing required parameter: path");
        };
        let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::err("invalid_params", "missing required parameter: content");
        };
        let path = ctx.workspace_dir.join(path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return ToolResult::err("io_error", format!("failed to create directories: {e}"));
                }
            }
        }

        let byte_len = content.len();
        if let Err(e) = std::fs::write(&path, content) {
            return ToolResult::err("io_error", format!("failed to write '{}': {e}", path.display()));
        }

        ToolResult::ok(format!("wrote {byte_len} bytes to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::SessionId;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn creates_parent_dirs_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            session_id: SessionId::from("s1"),
            workspace_dir: dir.path().to_path_buf(),
            cancellation: CancellationToken::new(),
            permission_grant: PermissionClass::Admin,
        };
        let tool = WriteFileTool;
        let result = tool
            .execute(serde_json::json!({"path": "nested/out.txt", "content": "hi"}), &ctx)
            .await;
        assert!(result.is_ok());
        assert_eq!(std::fs::read_to_string(dir.path().join("nested/out.txt")).unwrap(), "hi");
    }
}
