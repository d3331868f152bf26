// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{AgentTool, PermissionProbe, ToolCall, ToolCtx, ToolResponse};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Fetch a URL and return its content, converting HTML to readable text.
pub struct FetchTool;

#[async_trait]
impl AgentTool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch the content of a URL. HTML pages are converted to plain \
         text; other content is returned as-is (truncated when large)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The URL to fetch (http or https)" },
                "raw": { "type": "boolean", "description": "Return raw body without HTML-to-text conversion" }
            },
            "required": ["url"]
        })
    }

    fn permission_request(&self, call: &ToolCall) -> Option<PermissionProbe> {
        let url = call
            .args()
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Some(PermissionProbe {
            action: "fetch".into(),
            description: format!("fetch {url}"),
            params: call.args(),
        })
    }

    async fn run(&self, ctx: ToolCtx, call: ToolCall) -> anyhow::Result<ToolResponse> {
        let args = call.args();
        let url = match args.get("url").and_then(|v| v.as_str()) {
            Some(u) => u.to_string(),
            None => return Ok(ToolResponse::error("missing required parameter: url")),
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(ToolResponse::error("url must be http or https"));
        }
        let raw = args.get("raw").and_then(|v| v.as_bool()).unwrap_or(false);

        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        let request = client.get(&url).send();
        let resp = tokio::select! {
            resp = request => resp,
            _ = ctx.cancel.cancelled() => anyhow::bail!("tool execution canceled"),
        };
        let resp = match resp {
            Ok(r) => r,
            Err(e) => return Ok(ToolResponse::error(format!("fetch failed: {e}"))),
        };
        if !resp.status().is_success() {
            return Ok(ToolResponse::error(format!(
                "fetch failed: HTTP {}",
                resp.status()
            )));
        }
        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return Ok(ToolResponse::error(format!("fetch read failed: {e}"))),
        };

        let mut content = if is_html && !raw {
            html2text::from_read(body.as_bytes(), 100)
        } else {
            body
        };
        if content.len() > MAX_BODY_BYTES {
            content.truncate(MAX_BODY_BYTES);
            content.push_str("\n... (truncated)");
        }
        Ok(ToolResponse::text(content))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
