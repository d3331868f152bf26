// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{AgentTool, PermissionProbe, ToolCall, ToolCtx, ToolResponse};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Run a shell command in the working directory.  Permission gated;
/// honours cancellation by killing the child process.
pub struct BashTool {
    pub timeout_secs: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[async_trait]
impl AgentTool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory and return its \
         combined output. Long-running commands are killed at the timeout."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The command to execute" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (default 120)" }
            },
            "required": ["command"]
        })
    }

    fn permission_request(&self, call: &ToolCall) -> Option<PermissionProbe> {
        let command = call
            .args()
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Some(PermissionProbe {
            action: "execute".into(),
            description: format!("execute `{command}`"),
            params: call.args(),
        })
    }

    async fn run(&self, ctx: ToolCtx, call: ToolCall) -> anyhow::Result<ToolResponse> {
        let args = call.args();
        let command = match args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return Ok(ToolResponse::error("missing required parameter: command")),
        };
        let timeout = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(command = %command, timeout, "running shell command");
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&ctx.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future (cancel / timeout branch) must not
            // leave the process running.
            .kill_on_drop(true)
            .spawn()?;

        // wait_with_output drains both pipes while waiting, so a chatty
        // command cannot deadlock on a full pipe buffer.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = ctx.cancel.cancelled() => {
                anyhow::bail!("tool execution canceled");
            }
            _ = tokio::time::sleep(Duration::from_secs(timeout)) => {
                return Ok(ToolResponse::error(format!(
                    "command timed out after {timeout}s"
                )));
            }
        };
        let status = output.status;

        let mut out = String::new();
        out.push_str(&String::from_utf8_lossy(&output.stdout));
        out.push_str(&String::from_utf8_lossy(&output.stderr));
        if out.len() > MAX_OUTPUT_BYTES {
            out.truncate(MAX_OUTPUT_BYTES);
            out.push_str("\n... (output truncated)");
        }

        if status.success() {
            Ok(ToolResponse::text(if out.is_empty() {
                "(no output)".into()
            } else {
                out
            }))
        } else {
            let code = status.code().unwrap_or(-1);
            Ok(ToolResponse::error(format!(
                "exit status {code}\n{out}"
            )))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
