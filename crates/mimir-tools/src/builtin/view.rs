// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{AgentTool, ToolCall, ToolCtx, ToolResponse};

const MAX_LINES: usize = 2000;
const MAX_LINE_LEN: usize = 2000;

/// Read a file with line numbers, optionally windowed by offset/limit.
pub struct ViewTool;

#[async_trait]
impl AgentTool for ViewTool {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "Read a file from the working directory. Returns the content with \
         line numbers. Use offset/limit to window large files."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, absolute or relative to the working directory" },
                "offset": { "type": "integer", "description": "First line to show (1-based, default 1)" },
                "limit": { "type": "integer", "description": "Maximum number of lines (default 2000)" }
            },
            "required": ["path"]
        })
    }

    async fn run(&self, ctx: ToolCtx, call: ToolCall) -> anyhow::Result<ToolResponse> {
        let args = call.args();
        let path = match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return Ok(ToolResponse::error("missing required parameter: path")),
        };
        let full = ctx.root.join(&path);
        let content = match tokio::fs::read_to_string(&full).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(ToolResponse::error(format!(
                    "cannot read {}: {e}",
                    full.display()
                )))
            }
        };

        let offset = args
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|n| (n as usize).saturating_sub(1))
            .unwrap_or(0);
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(MAX_LINES)
            .min(MAX_LINES);

        let mut out = String::new();
        let mut shown = 0usize;
        let mut truncated = false;
        for (i, line) in content.lines().enumerate().skip(offset) {
            if shown >= limit {
                truncated = true;
                break;
            }
            let line = if line.len() > MAX_LINE_LEN {
                &line[..MAX_LINE_LEN]
            } else {
                line
            };
            out.push_str(&format!("{:>6}\t{line}\n", i + 1));
            shown += 1;
        }
        if truncated {
            out.push_str("... (truncated; use offset to read more)\n");
        }
        if out.is_empty() {
            out.push_str("(empty file)");
        }
        Ok(ToolResponse::text(out))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(input: &str) -> ToolCall {
        ToolCall {
            id: "tc".into(),
            name: "view".into(),
            input: input.into(),
        }
    }

    #[tokio::test]
    async fn reads_file_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "first\nsecond\n").unwrap();
        let ctx = ToolCtx::new("s", "m").with_root(dir.path());
        let resp = ViewTool
            .run(ctx, call(r#"{"path":"a.txt"}"#))
            .await
            .unwrap();
        assert!(!resp.is_error);
        assert!(resp.content.contains("1\tfirst"));
        assert!(resp.content.contains("2\tsecond"));
    }

    #[tokio::test]
    async fn offset_and_limit_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "l1\nl2\nl3\nl4\n").unwrap();
        let ctx = ToolCtx::new("s", "m").with_root(dir.path());
        let resp = ViewTool
            .run(ctx, call(r#"{"path":"a.txt","offset":2,"limit":2}"#))
            .await
            .unwrap();
        assert!(!resp.content.contains("l1"));
        assert!(resp.content.contains("l2"));
        assert!(resp.content.contains("l3"));
        assert!(!resp.content.contains("l4"));
    }

    #[tokio::test]
    async fn missing_file_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolCtx::new("s", "m").with_root(dir.path());
        let resp = ViewTool
            .run(ctx, call(r#"{"path":"nope.txt"}"#))
            .await
            .unwrap();
        assert!(resp.is_error);
    }

    #[tokio::test]
    async fn missing_path_parameter_is_tool_error() {
        let ctx = ToolCtx::new("s", "m");
        let resp = ViewTool.run(ctx, call("{}")).await.unwrap();
        assert!(resp.is_error);
        assert!(resp.content.contains("path"));
    }
}
