// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mimir_session::Message;

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Everything one generation step needs.  Sampling knobs that are `None`
/// are omitted from the wire request so provider defaults apply.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// System prompt text.  Serialized provider-appropriately (top-level
    /// `system` field, leading system message, `systemInstruction`, …).
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Merged provider option bag (catalog defaults → provider defaults →
    /// per-model override).  Drivers read the keys they understand.
    pub provider_options: serde_json::Value,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

/// Why the provider stopped generating.  The Session Agent maps these to
/// message-level finish reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// Natural end of turn (`stop` / `end_turn`).
    Stop,
    /// Output token limit reached (`length` / `max_tokens`).
    Length,
    /// The model requested tool execution.
    ToolCalls,
    #[default]
    Unknown,
}

/// Per-step token usage in the four billing categories.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

/// One streamed generation event.
///
/// Every event maps to exactly one mutation of the in-flight assistant
/// message; see the Session Agent's event application.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    ReasoningDelta(String),
    /// The reasoning block closed.  `signature` / `metadata` are opaque
    /// provider blobs required to replay the thought on later turns.
    ReasoningEnd {
        signature: Option<String>,
        metadata: serde_json::Value,
    },
    TextDelta(String),
    ToolInputStart {
        id: String,
        name: String,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    ToolInputEnd {
        id: String,
    },
    /// A tool the provider executed itself (server-side tools).
    ToolResult {
        tool_call_id: String,
        name: String,
        result: serde_json::Value,
        is_error: bool,
    },
    /// Terminal event of a successful step.  Emitted exactly once.
    StepFinish {
        reason: StopReason,
        usage: Usage,
    },
    /// Observational: the driver hit a transient failure and will retry
    /// after `delay`.  Backoff is handled inside the driver.
    Retry {
        error: String,
        delay: Duration,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
