// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{AgentTool, ToolCall, ToolCtx, ToolResponse};

/// List a directory, directories marked with a trailing slash.
pub struct LsTool;

#[async_trait]
impl AgentTool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Defaults to the working directory."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: working directory)" }
            }
        })
    }

    async fn run(&self, ctx: ToolCtx, call: ToolCall) -> anyhow::Result<ToolResponse> {
        let args = call.args();
        let rel = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let dir = ctx.root.join(rel);

        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) => {
                return Ok(ToolResponse::error(format!(
                    "cannot list {}: {e}",
                    dir.display()
                )))
            }
        };
        let mut entries: Vec<String> = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        if entries.is_empty() {
            return Ok(ToolResponse::text("(empty directory)"));
        }
        Ok(ToolResponse::text(entries.join("\n")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
