// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter exposing MCP server tools through the [`AgentTool`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use mimir_tools::{AgentTool, PermissionProbe, ToolCall, ToolCtx, ToolResponse};

use crate::manager::McpManager;
use crate::protocol::McpToolDef;

/// One MCP-published tool, named `<server>_<tool>` in the agent tool set.
pub struct McpTool {
    manager: Arc<McpManager>,
    server: String,
    def: McpToolDef,
    full_name: String,
}

impl McpTool {
    pub fn new(manager: Arc<McpManager>, server: impl Into<String>, def: McpToolDef) -> Self {
        let server = server.into();
        let full_name = format!("{server}_{}", def.name);
        Self {
            manager,
            server,
            def,
            full_name,
        }
    }

    /// Wrap every tool currently published by the manager.
    pub async fn tools_for(manager: &Arc<McpManager>) -> Vec<Arc<dyn AgentTool>> {
        manager
            .tools()
            .await
            .into_iter()
            .map(|(server, def)| {
                Arc::new(McpTool::new(Arc::clone(manager), server, def)) as Arc<dyn AgentTool>
            })
            .collect()
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

#[async_trait]
impl AgentTool for McpTool {
    fn name(&self) -> &str {
        &self.full_name
    }

    fn description(&self) -> &str {
        if self.def.description.is_empty() {
            "MCP-provided tool"
        } else {
            &self.def.description
        }
    }

    fn schema(&self) -> Value {
        if self.def.input_schema.is_object() {
            self.def.input_schema.clone()
        } else {
            json!({ "type": "object" })
        }
    }

    fn permission_request(&self, call: &ToolCall) -> Option<PermissionProbe> {
        Some(PermissionProbe {
            action: "execute".into(),
            description: format!("execute {}.{}", self.server, self.def.name),
            params: call.args(),
        })
    }

    async fn run(&self, ctx: ToolCtx, call: ToolCall) -> anyhow::Result<ToolResponse> {
        if ctx.session_id.is_empty() || ctx.message_id.is_empty() {
            return Ok(ToolResponse::error(
                "session id and message id are required for MCP tool calls",
            ));
        }
        debug!(
            server = %self.server,
            tool = %self.def.name,
            session_id = %ctx.session_id,
            "dispatching MCP tool call"
        );

        let args = call.args();
        let result = tokio::select! {
            result = self.manager.call_tool(&self.server, &self.def.name, args) => result,
            _ = ctx.cancel.cancelled() => anyhow::bail!("tool execution canceled"),
        };
        match result {
            Ok(r) if r.is_error => Ok(ToolResponse::error(r.text_content())),
            Ok(r) => Ok(ToolResponse::text(r.text_content())),
            // Server unreachable, renewal failed, protocol fault: surface
            // as a tool error so the conversation loop continues.
            Err(e) => Ok(ToolResponse::error(e.to_string())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
