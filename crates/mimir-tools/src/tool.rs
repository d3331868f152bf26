// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Raw JSON argument text as accumulated from the stream.
    pub input: String,
}

impl ToolCall {
    /// Parsed arguments; malformed input degrades to an empty object so a
    /// single bad call never panics the dispatcher.
    pub fn args(&self) -> Value {
        serde_json::from_str(&self.input).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Per-invocation context threaded into every tool run.
///
/// `session_id` / `message_id` identify the calling conversation (required
/// by MCP and sub-agent tools); `cancel` must be honoured at every
/// suspension point.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub session_id: String,
    pub message_id: String,
    /// Directory the filesystem tools resolve relative paths against.
    pub root: PathBuf,
    pub cancel: CancellationToken,
}

impl ToolCtx {
    pub fn new(session_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            root: PathBuf::from("."),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Shape of a tool's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    Text,
    Error,
    /// Image or other non-text payload.
    Media,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub content: String,
    pub is_error: bool,
    pub kind: OutputKind,
    pub metadata: Value,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            kind: OutputKind::Text,
            metadata: Value::Null,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            content: msg.into(),
            is_error: true,
            kind: OutputKind::Error,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What a tool wants the permission service to ask before it runs.
#[derive(Debug, Clone)]
pub struct PermissionProbe {
    pub action: String,
    pub description: String,
    pub params: Value,
}

/// Trait every tool — built-in, MCP-sourced, or sub-agent — implements.
///
/// Failures that are part of normal operation (file missing, command
/// non-zero) come back as `ToolResponse::error`; `Err` is reserved for
/// cancellation and infrastructure faults, which the dispatcher maps to
/// the appropriate finish reason.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the input object.
    fn schema(&self) -> Value;
    /// `Some` when this call must be cleared with the permission service
    /// first.  Read-only tools return `None` and run ungated.
    fn permission_request(&self, _call: &ToolCall) -> Option<PermissionProbe> {
        None
    }
    async fn run(&self, ctx: ToolCtx, call: ToolCall) -> anyhow::Result<ToolResponse>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
