// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted conversation, anchored to a working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Set for child sessions spawned by the sub-agent tool.
    pub parent_session_id: Option<String>,
    pub title: String,
    /// Accumulated dollar cost.  Monotonically non-decreasing; `Sessions::save`
    /// clamps attempts to lower it.
    pub cost: f64,
    /// Prompt-side token count of the last completed step
    /// (input + cache-creation tokens).
    pub prompt_tokens: u64,
    /// Completion-side token count of the last completed step
    /// (output + cache-read tokens).
    pub completion_tokens: u64,
    /// When set, history submitted to the model starts at this message
    /// with its role rewritten to User.
    pub summary_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// How an assistant message ended.  At most one Finish part per message;
/// its presence marks the message terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Canceled,
    Error,
    PermissionDenied,
    Unknown,
}

/// A tool invocation requested by the model.  `input` accumulates raw JSON
/// text while streaming and is only parseable once `finished` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub id: String,
    pub name: String,
    pub input: String,
    pub finished: bool,
    /// True when the provider ran the tool itself (server-side tools);
    /// such calls are not dispatched locally.
    #[serde(default)]
    pub provider_executed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPart {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A single content part of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    /// Hidden chain-of-thought.  `signature` / `metadata` carry the opaque
    /// provider blob some APIs require to accept the thought back on the
    /// next turn.
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
        started_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finished_at: Option<DateTime<Utc>>,
    },
    /// Remote or data-URL image attachment (user messages only).
    ImageUrl {
        url: String,
    },
    /// Inline binary attachment, base64-encoded (user messages only).
    Binary {
        mime_type: String,
        data: String,
    },
    ToolCall(ToolCallPart),
    ToolResult(ToolResultPart),
    Finish {
        reason: FinishReason,
        time: DateTime<Utc>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        details: String,
    },
}

/// A user attachment on a [`crate::Message`], added by the surface layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    ImageUrl { url: String },
    Binary { mime_type: String, data: String },
}

impl Attachment {
    pub fn into_part(self) -> Part {
        match self {
            Attachment::ImageUrl { url } => Part::ImageUrl { url },
            Attachment::Binary { mime_type, data } => Part::Binary { mime_type, data },
        }
    }
}

/// One message in a session's ordered log.
///
/// The part list is append-only except for in-place mutation of the
/// currently streaming assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    /// Model / provider ids stamped on assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Transient marker telling caching-capable providers to place a cache
    /// breakpoint after this message.  Re-derived every step; not persisted.
    #[serde(skip)]
    pub cache_hint: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Concatenated visible text of the message.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for p in &self.parts {
            if let Part::Text { text } = p {
                out.push_str(text);
            }
        }
        out
    }

    /// Concatenated reasoning text.
    pub fn reasoning(&self) -> String {
        let mut out = String::new();
        for p in &self.parts {
            if let Part::Reasoning { text, .. } = p {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results(&self) -> Vec<&ToolResultPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResult(tr) => Some(tr),
                _ => None,
            })
            .collect()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().find_map(|p| match p {
            Part::Finish { reason, .. } => Some(*reason),
            _ => None,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason().is_some()
    }

    /// True for an assistant message that was cancelled before producing any
    /// output; such shells are elided from history submitted to the provider.
    pub fn is_empty_shell(&self) -> bool {
        self.role == Role::Assistant
            && self.text().is_empty()
            && self.reasoning().is_empty()
            && self.tool_calls().is_empty()
    }

    // ── Streaming mutation helpers ───────────────────────────────────────────
    //
    // Each helper performs exactly one logical mutation; the agent persists
    // the message after every call so the UI sees the stream grow in order.

    pub fn append_text(&mut self, delta: &str) {
        if let Some(Part::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
            return;
        }
        self.parts.push(Part::Text {
            text: delta.to_string(),
        });
    }

    /// Append to the open Reasoning part, creating it on the first delta.
    pub fn append_reasoning(&mut self, delta: &str) {
        for p in self.parts.iter_mut().rev() {
            if let Part::Reasoning {
                text, finished_at, ..
            } = p
            {
                if finished_at.is_none() {
                    text.push_str(delta);
                    return;
                }
                break;
            }
        }
        self.parts.push(Part::Reasoning {
            text: delta.to_string(),
            signature: None,
            metadata: serde_json::Value::Null,
            started_at: Utc::now(),
            finished_at: None,
        });
    }

    /// Close the open Reasoning part, attaching the provider blob.
    /// A no-op when no reasoning is in progress.
    pub fn finish_reasoning(
        &mut self,
        sig: Option<String>,
        meta: serde_json::Value,
    ) {
        for p in self.parts.iter_mut().rev() {
            if let Part::Reasoning {
                signature,
                metadata,
                finished_at,
                ..
            } = p
            {
                if finished_at.is_none() {
                    *finished_at = Some(Utc::now());
                    if sig.is_some() {
                        *signature = sig;
                    }
                    if !meta.is_null() {
                        *metadata = meta;
                    }
                }
                return;
            }
        }
    }

    pub fn add_tool_call(&mut self, id: &str, name: &str) {
        self.parts.push(Part::ToolCall(ToolCallPart {
            id: id.to_string(),
            name: name.to_string(),
            input: String::new(),
            finished: false,
            provider_executed: false,
        }));
    }

    pub fn append_tool_input(&mut self, id: &str, delta: &str) {
        for p in self.parts.iter_mut() {
            if let Part::ToolCall(tc) = p {
                if tc.id == id {
                    tc.input.push_str(delta);
                    return;
                }
            }
        }
    }

    pub fn finish_tool_call(&mut self, id: &str) {
        for p in self.parts.iter_mut() {
            if let Part::ToolCall(tc) = p {
                if tc.id == id {
                    tc.finished = true;
                    return;
                }
            }
        }
    }

    pub fn mark_provider_executed(&mut self, id: &str) {
        for p in self.parts.iter_mut() {
            if let Part::ToolCall(tc) = p {
                if tc.id == id {
                    tc.provider_executed = true;
                    return;
                }
            }
        }
    }

    /// Force every unfinished tool call to `finished` with input `"{}"`.
    /// Used when the stream terminates before tool inputs completed, so the
    /// tool-call/tool-result invariant can still be satisfied.
    pub fn force_finish_tool_calls(&mut self) {
        for p in self.parts.iter_mut() {
            if let Part::ToolCall(tc) = p {
                if !tc.finished {
                    if tc.input.is_empty() {
                        tc.input = "{}".to_string();
                    }
                    tc.finished = true;
                }
            }
        }
    }

    pub fn add_tool_result(&mut self, result: ToolResultPart) {
        self.parts.push(Part::ToolResult(result));
    }

    /// Write the terminal Finish part, replacing any prior one so the
    /// at-most-one-Finish invariant holds.
    pub fn set_finish(&mut self, reason: FinishReason, message: String, details: String) {
        self.parts.retain(|p| !matches!(p, Part::Finish { .. }));
        self.parts.push(Part::Finish {
            reason,
            time: Utc::now(),
            message,
            details,
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
