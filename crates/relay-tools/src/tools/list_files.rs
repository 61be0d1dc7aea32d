//! Tool: list_files — list directory contents with type and size info.

use async_trait::async_trait;
use relay_core::types::{PermissionClass, SideEffects};

use crate::registry::{Tool, ToolContext, ToolDescriptor, ToolResult};

const MAX_ENTRIES: usize = 1_000;

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "list_files".to_string(),
            description: "List the contents of a directory. Returns at most 1000 entries."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
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
        let path = ctx.workspace_dir.join(path);

        let read_dir = match std::fs::read_dir(&path) {
            Ok(rd) => rd,
            Err(e) => return ToolResult::err("io_error", format!("failed to list '{}': {e}", path.display())),
        };

        let mut entries: Vec<String> = Vec::new();
        let mut truncated = false;

        for entry in read_dir {
            if entries.len() >= MAX_ENTRIES {
                truncated = true;
                break;
            }
            let Ok(entry) = entry else { continue };
            let Ok(metadata) = entry.metadata() else { continue };
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = if metadata.is_dir() { "dir" } else { "file" };
            entries.push(format!("[{kind}] {name} ({} bytes)", metadata.len()));
        }

        entries.sort();
        let mut output = entries.join("\n");
        if truncated {
            output.push_str(&format!("\n\n[truncated at {MAX_ENTRIES} entries]"));
        }

        ToolResult::ok(output)
    }
}
