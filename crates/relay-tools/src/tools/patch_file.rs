//! `patch_file` — surgical string replacement inside a file.
//!
//! Reads the file, replaces an exact (whitespace-sensitive) match, and
//! writes the result back atomically via a temp file + rename.

use async_trait::async_trait;
use relay_core::types::{PermissionClass, SideEffects};

use crate::registry::{Tool, ToolContext, ToolDescriptor, ToolResult};

pub struct PatchFileTool;

#[async_trait]
impl Tool for PatchFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "patch_file".to_string(),
            description: "Replace an exact string in a file with new text. The match is \
                whitespace-sensitive; copy old_string verbatim from read_file output. \
                Errors if old_string is absent or ambiguous."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"},
                    "replace_all": {"type": "boolean"}
                },
                "required": ["path", "old_string", "new_string"]
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
        let Some(old) = input.get("old_string").and_then(|v| v.as_str()) else {
            return ToolResult::err("invalid_params", "missing required parameter: old_string");
        };
        let Some(new) = input.get("new_string").and_then(|v| v.as_str()) else {
            return ToolResult::err("invalid_params", "missing required parameter: new_string");
        };
        let replace_all = input.get("replace_all").and_then(|v| v.as_bool()).unwrap_or(false);
        let path = ctx.workspace_dir.join(path);

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => return ToolResult::err("io_error", format!("failed to read '{}': {e}", path.display())),
        };

        let count = content.matches(old).count();
        if count == 0 {
            return ToolResult::err("not_found", "old_string not found; read the file first and copy it verbatim");
        }
        if !replace_all && count > 1 {
            return ToolResult::err(
                "ambiguous_match",
                format!("old_string matches {count} times; add context or set replace_all=true"),
            );
        }

        let updated = if replace_all { content.replace(old, new) } else { content.replacen(old, new, 1) };

        let tmp = path.with_extension("relay_patch_tmp");
        if let Err(e) = std::fs::write(&tmp, &updated) {
            return ToolResult::err("io_error", format!("failed to write temp file: {e}"));
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return ToolResult::err("io_error", format!("failed to rename temp file: {e}"));
        }

        ToolResult::ok(format!("patched {} occurrence(s) in '{}'", count, path.display()))
    }
}
