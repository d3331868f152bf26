// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{AgentTool, ToolCall, ToolCtx, ToolResponse};

const MAX_RESULTS: usize = 200;

/// Find files whose relative path matches a glob pattern.
pub struct GlobTool;

#[async_trait]
impl AgentTool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern (e.g. `**/*.rs`, `src/*.txt`). \
         Returns paths relative to the search directory."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Glob pattern: `*` within a segment, `**` across segments, `?` for one character" },
                "path": { "type": "string", "description": "Directory to search (default: working directory)" }
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
        let rel = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let base = ctx.root.join(rel);

        let re = match glob_to_regex(&pattern) {
            Some(re) => re,
            None => return Ok(ToolResponse::error(format!("invalid pattern: {pattern}"))),
        };

        // walkdir is synchronous; the tree walk is bounded and fast enough
        // to run inline on the worker thread.
        let mut matches: Vec<String> = Vec::new();
        let mut truncated = false;
        for entry in WalkDir::new(&base)
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
            let rel_path = match entry.path().strip_prefix(&base) {
                Ok(p) => p.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if re.is_match(&rel_path) {
                if matches.len() >= MAX_RESULTS {
                    truncated = true;
                    break;
                }
                matches.push(rel_path);
            }
        }
        matches.sort();
        if matches.is_empty() {
            return Ok(ToolResponse::text("no files matched"));
        }
        let mut out = matches.join("\n");
        if truncated {
            out.push_str("\n... (truncated)");
        }
        Ok(ToolResponse::text(out))
    }
}

/// Translate a glob pattern to an anchored regex over `/`-separated
/// relative paths.  `**` crosses directory boundaries, `*` and `?` do not.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following '/' so `**/` also matches zero
                    // directories.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
