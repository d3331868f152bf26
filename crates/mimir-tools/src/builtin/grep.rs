// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{AgentTool, ToolCall, ToolCtx, ToolResponse};

const MAX_MATCHES: usize = 100;
const MAX_FILE_BYTES: u64 = 4 * 1024 * 1024;

/// Search file contents with a regular expression.
pub struct GrepTool;

#[async_trait]
impl AgentTool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns \
         `path:line: text` matches, leading matches first."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression to search for" },
                "path": { "type": "string", "description": "Directory to search (default: working directory)" },
                "include": { "type": "string", "description": "Only search files whose name contains this substring" }
            },
            "required": ["pattern"]
        })
    }

    async fn run(&self, ctx: ToolCtx, call: ToolCall) -> anyhow::Result<ToolResponse> {
        let args = call.args();
        let pattern = match args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return Ok(ToolResponse::error("missing required parameter: pattern")),
        };
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => return Ok(ToolResponse::error(format!("invalid pattern: {e}"))),
        };
        let rel = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let include = args
            .get("include")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let base = ctx.root.join(rel);

        let mut out = String::new();
        let mut count = 0usize;
        'files: for entry in WalkDir::new(&base)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if ctx.cancel.is_cancelled() {
                anyhow::bail!("tool execution canceled");
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(inc) = &include {
                if !entry.file_name().to_string_lossy().contains(inc.as_str()) {
                    continue;
                }
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_FILE_BYTES {
                continue;
            }
            let bytes = match std::fs::read(entry.path()) {
                Ok(b) => b,
                Err(_) => continue,
            };
            if bytes.contains(&0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            let rel_path = entry
                .path()
                .strip_prefix(&base)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| entry.path().display().to_string());
            for (i, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    out.push_str(&format!("{rel_path}:{}: {}\n", i + 1, line.trim_end()));
                    count += 1;
                    if count >= MAX_MATCHES {
                        out.push_str("... (more matches not shown)\n");
                        break 'files;
                    }
                }
            }
        }
        if count == 0 {
            return Ok(ToolResponse::text("no matches"));
        }
        Ok(ToolResponse::text(out))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
