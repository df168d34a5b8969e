//! Built-in file tools: read (open) and write (requires approval).
//!
//! Paths resolve relative to the working directory:
//! - `output/report.md` → `{working_dir}/output/report.md`
//! - `/etc/hosts` → used as-is

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{resolve_path, PermissionTier, Tool};

/// Read the contents of a file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file, optionally restricted to a line range."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the working directory or absolute."
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: start reading from this line number (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: stop reading at this line number (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<Value> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;

        let resolution = resolve_path(path, working_dir);

        if !resolution.resolved.exists() {
            return Err(anyhow::anyhow!(
                "File not found: {} (resolved to: {})",
                path,
                resolution.resolved.display()
            ));
        }

        let bytes = tokio::fs::read(&resolution.resolved).await?;
        let content = String::from_utf8(bytes)
            .map_err(|_| anyhow::anyhow!("Binary file, cannot display: {}", path))?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start = args["start_line"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(1)
            .saturating_sub(1)
            .min(total_lines);
        let end = args["end_line"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(total_lines)
            .min(total_lines);
        let (start, end) = if start > end { (end, start) } else { (start, end) };

        // The path is echoed back so claims derived from this result can cite it.
        Ok(json!({
            "path": path,
            "total_lines": total_lines,
            "content": lines[start..end].join("\n"),
        }))
    }
}

/// Write content to a file (create or overwrite).
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the working directory or absolute."
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn permission_tier(&self) -> PermissionTier {
        PermissionTier::RequiresApproval
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<Value> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'content' argument"))?;

        let resolution = resolve_path(path, working_dir);

        if let Some(parent) = resolution.resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&resolution.resolved, content).await?;

        // Verify write by reading back
        let written = tokio::fs::read_to_string(&resolution.resolved).await?;
        if written.len() != content.len() {
            return Err(anyhow::anyhow!(
                "Write verification failed: expected {} bytes, got {}",
                content.len(),
                written.len()
            ));
        }

        Ok(json!({
            "path": path,
            "bytes_written": content.len(),
            "outside_working_dir": resolution.is_outside_workspace,
        }))
    }
}
