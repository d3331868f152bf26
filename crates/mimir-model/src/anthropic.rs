// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic driver — native `/v1/messages` SSE streaming.
//!
//! Auth: keys prefixed with `Bearer ` are sent as an `Authorization`
//! header (gateway installations), anything else as `x-api-key`.
//! When thinking is enabled the `interleaved-thinking-2025-05-14` beta is
//! appended to `anthropic-beta` (comma-joined, deduplicated).
//!
//! Caching: the system block always carries `cache_control`; messages with
//! a cache hint get the marker on their last content block; the last tool
//! definition is marked so the whole tools array caches as one prefix.

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use mimir_session::{Message, Part, Role};

use crate::{
    provider::EventStream, retry_delay, retryable_status, StopReason, StreamEvent,
    StreamOptions, Usage, MAX_STREAM_RETRIES,
};

pub struct AnthropicModel {
    model: String,
    api_key: Option<String>,
    base_url: String,
    extra_headers: Vec<(String, String)>,
    think: bool,
    client: reqwest::Client,
}

impl AnthropicModel {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        headers: HashMap<String, String>,
        think: bool,
    ) -> Self {
        let mut extra_headers: Vec<(String, String)> =
            headers.into_iter().collect();
        extra_headers.sort();
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            extra_headers,
            think,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, opts: &StreamOptions) -> Value {
        let messages = build_messages(&opts.messages);
        let max_tokens = opts
            .max_output_tokens
            .or_else(|| self.catalog_max_output())
            .unwrap_or(4096);

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = opts.top_k {
            body["top_k"] = json!(k);
        }

        if !opts.system.is_empty() {
            body["system"] = json!([{
                "type": "text",
                "text": opts.system,
                "cache_control": { "type": "ephemeral" },
            }]);
        }

        if !opts.tools.is_empty() {
            let last = opts.tools.len() - 1;
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let mut tool = json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    });
                    if i == last {
                        tool["cache_control"] = json!({ "type": "ephemeral" });
                    }
                    tool
                })
                .collect();
            body["tools"] = json!(tools);
        }

        if let Some(budget) = opts.provider_options["thinking"]["budget_tokens"].as_u64() {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        body
    }

    fn thinking_enabled(&self, opts: &StreamOptions) -> bool {
        self.think || !opts.provider_options["thinking"].is_null()
    }

    fn catalog_max_output(&self) -> Option<u32> {
        use crate::LanguageModel;
        self.catalog().map(|e| e.max_output_tokens)
    }

    /// Request headers: auth, version, extra config headers, and the beta
    /// list with the thinking beta appended when enabled.
    fn build_headers(&self, thinking: bool) -> anyhow::Result<Vec<(String, String)>> {
        let key = self
            .api_key
            .as_deref()
            .context("anthropic API key not set")?;
        let mut headers: Vec<(String, String)> = Vec::new();
        if let Some(token) = key.strip_prefix("Bearer ") {
            headers.push(("Authorization".into(), format!("Bearer {token}")));
        } else {
            headers.push(("x-api-key".into(), key.to_string()));
        }
        headers.push(("anthropic-version".into(), "2023-06-01".into()));

        let mut betas: Vec<String> = Vec::new();
        for (name, value) in &self.extra_headers {
            if name.eq_ignore_ascii_case("anthropic-beta") {
                betas.extend(value.split(',').map(|s| s.trim().to_string()));
            } else {
                headers.push((name.clone(), value.clone()));
            }
        }
        if thinking {
            betas.push("interleaved-thinking-2025-05-14".into());
        }
        let mut seen = std::collections::HashSet::new();
        betas.retain(|b| !b.is_empty() && seen.insert(b.clone()));
        if !betas.is_empty() {
            headers.push(("anthropic-beta".into(), betas.join(",")));
        }
        Ok(headers)
    }
}

#[async_trait]
impl crate::LanguageModel for AnthropicModel {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream(&self, opts: StreamOptions) -> anyhow::Result<EventStream> {
        let body = self.build_body(&opts);
        let headers = self.build_headers(self.thinking_enabled(&opts))?;
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let client = self.client.clone();

        let stream = try_stream! {
            let mut attempt = 0u32;
            let resp = loop {
                let mut rb = client.post(&url).json(&body);
                for (name, value) in &headers {
                    rb = rb.header(name.as_str(), value.as_str());
                }
                let resp = rb.send().await.context("anthropic request failed")?;
                let status = resp.status();
                if retryable_status(status) && attempt < MAX_STREAM_RETRIES {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    let delay = retry_delay(retry_after.as_deref(), attempt);
                    let text = resp.text().await.unwrap_or_default();
                    yield StreamEvent::Retry {
                        error: format!("anthropic {status}: {text}"),
                        delay,
                    };
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    Err(anyhow!("anthropic error {status}: {text}"))?;
                    unreachable!();
                }
                break resp;
            };

            // SSE lines can be split across TCP chunks; only complete lines
            // are parsed, the remainder carries over.
            let mut bytes = resp.bytes_stream();
            let mut buf = String::new();
            let mut state = SseState::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.context("anthropic stream read failed")?;
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            for ev in state.apply(&v)? {
                                yield ev;
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// What kind of content block each stream index carries.
#[derive(Debug, Clone)]
enum BlockKind {
    Text,
    Thinking { signature: String },
    ToolUse { id: String },
}

/// Stateful SSE translation: Anthropic events reference content blocks by
/// index, so the block table is carried across events.
#[derive(Default)]
struct SseState {
    blocks: HashMap<u64, BlockKind>,
    usage: Usage,
    reason: StopReason,
}

impl SseState {
    fn apply(&mut self, v: &Value) -> anyhow::Result<Vec<StreamEvent>> {
        let event_type = v["type"].as_str().unwrap_or("");
        match event_type {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    self.usage.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                    self.usage.cache_read_tokens =
                        usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                    self.usage.cache_creation_tokens =
                        usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
                }
                Ok(vec![])
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "tool_use" => {
                        let id = block["id"].as_str().unwrap_or("").to_string();
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        self.blocks
                            .insert(index, BlockKind::ToolUse { id: id.clone() });
                        Ok(vec![StreamEvent::ToolInputStart { id, name }])
                    }
                    "thinking" => {
                        self.blocks.insert(
                            index,
                            BlockKind::Thinking {
                                signature: String::new(),
                            },
                        );
                        Ok(vec![])
                    }
                    _ => {
                        self.blocks.insert(index, BlockKind::Text);
                        Ok(vec![])
                    }
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("").to_string();
                        if text.is_empty() {
                            Ok(vec![])
                        } else {
                            Ok(vec![StreamEvent::TextDelta(text)])
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                        match self.blocks.get(&index) {
                            Some(BlockKind::ToolUse { id }) => {
                                Ok(vec![StreamEvent::ToolInputDelta {
                                    id: id.clone(),
                                    delta: partial,
                                }])
                            }
                            _ => {
                                warn!(index, "input_json_delta for unknown block");
                                Ok(vec![])
                            }
                        }
                    }
                    "thinking_delta" => {
                        let text = delta["thinking"].as_str().unwrap_or("").to_string();
                        if text.is_empty() {
                            Ok(vec![])
                        } else {
                            Ok(vec![StreamEvent::ReasoningDelta(text)])
                        }
                    }
                    // The encrypted signature blob arrives at the end of a
                    // thinking block; it is required to replay the thought
                    // and must never surface as readable text.
                    "signature_delta" => {
                        if let Some(BlockKind::Thinking { signature }) =
                            self.blocks.get_mut(&index)
                        {
                            signature
                                .push_str(delta["signature"].as_str().unwrap_or(""));
                        }
                        Ok(vec![])
                    }
                    _ => Ok(vec![]),
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                match self.blocks.remove(&index) {
                    Some(BlockKind::ToolUse { id }) => {
                        Ok(vec![StreamEvent::ToolInputEnd { id }])
                    }
                    Some(BlockKind::Thinking { signature }) => {
                        let signature =
                            if signature.is_empty() { None } else { Some(signature) };
                        Ok(vec![StreamEvent::ReasoningEnd {
                            signature,
                            metadata: Value::Null,
                        }])
                    }
                    _ => Ok(vec![]),
                }
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.reason = match reason {
                        "end_turn" | "stop_sequence" => StopReason::Stop,
                        "tool_use" => StopReason::ToolCalls,
                        "max_tokens" => StopReason::Length,
                        _ => StopReason::Unknown,
                    };
                }
                if let Some(usage) = v.get("usage") {
                    self.usage.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
                }
                Ok(vec![])
            }
            "message_stop" => Ok(vec![StreamEvent::StepFinish {
                reason: self.reason,
                usage: self.usage,
            }]),
            "error" => {
                let msg = v["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error");
                Err(anyhow!("anthropic stream error: {msg}"))
            }
            // ping and future event kinds
            _ => Ok(vec![]),
        }
    }
}

/// Convert the message log to the Anthropic wire format.
///
/// Tool-role messages become `user` turns carrying `tool_result` blocks.
/// Thinking parts are replayed only when they carry a signature — the API
/// rejects unsigned thinking blocks.  A message-level cache hint marks the
/// last content block of that message with `cache_control`.
pub(crate) fn build_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for m in messages {
        if m.role == Role::System {
            continue;
        }
        let role = match m.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        let mut blocks: Vec<Value> = Vec::new();
        for p in &m.parts {
            match p {
                Part::Text { text } if !text.is_empty() => {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                Part::Reasoning {
                    text,
                    signature: Some(sig),
                    ..
                } => {
                    blocks.push(json!({
                        "type": "thinking",
                        "thinking": text,
                        "signature": sig,
                    }));
                }
                Part::ImageUrl { url } => {
                    blocks.push(json!({
                        "type": "image",
                        "source": { "type": "url", "url": url },
                    }));
                }
                Part::Binary { mime_type, data } => {
                    blocks.push(json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": mime_type,
                            "data": data,
                        },
                    }));
                }
                Part::ToolCall(tc) if tc.finished => {
                    let input: Value =
                        serde_json::from_str(&tc.input).unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": input,
                    }));
                }
                Part::ToolResult(tr) => {
                    blocks.push(json!({
                        "type": "tool_result",
                        "tool_use_id": tr.tool_call_id,
                        "content": tr.content,
                        "is_error": tr.is_error,
                    }));
                }
                _ => {}
            }
        }
        if blocks.is_empty() {
            continue;
        }
        if m.cache_hint {
            if let Some(last) = blocks.last_mut() {
                last["cache_control"] = json!({ "type": "ephemeral" });
            }
        }
        out.push(json!({ "role": role, "content": blocks }));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mimir_session::{FinishReason, ToolResultPart};

    fn model() -> AnthropicModel {
        AnthropicModel::new(
            "claude-sonnet-4-5".into(),
            Some("sk-test".into()),
            None,
            HashMap::new(),
            false,
        )
    }

    fn message(role: Role) -> Message {
        Message {
            id: "m".into(),
            session_id: "s".into(),
            role,
            parts: Vec::new(),
            model: None,
            provider: None,
            cache_hint: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // ── Headers ───────────────────────────────────────────────────────────────

    #[test]
    fn plain_key_uses_x_api_key() {
        let headers = model().build_headers(false).unwrap();
        assert!(headers.iter().any(|(n, v)| n == "x-api-key" && v == "sk-test"));
        assert!(!headers.iter().any(|(n, _)| n == "Authorization"));
    }

    #[test]
    fn bearer_key_uses_authorization_header() {
        let m = AnthropicModel::new(
            "claude-sonnet-4-5".into(),
            Some("Bearer tok-123".into()),
            None,
            HashMap::new(),
            false,
        );
        let headers = m.build_headers(false).unwrap();
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Authorization" && v == "Bearer tok-123"));
        assert!(!headers.iter().any(|(n, _)| n == "x-api-key"));
    }

    #[test]
    fn thinking_appends_interleaved_beta() {
        let headers = model().build_headers(true).unwrap();
        let beta = headers
            .iter()
            .find(|(n, _)| n == "anthropic-beta")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(beta.contains("interleaved-thinking-2025-05-14"));
    }

    #[test]
    fn beta_header_merges_and_deduplicates() {
        let mut extra = HashMap::new();
        extra.insert(
            "anthropic-beta".to_string(),
            "interleaved-thinking-2025-05-14,context-1m-2025-08-07".to_string(),
        );
        let m = AnthropicModel::new(
            "claude-sonnet-4-5".into(),
            Some("k".into()),
            None,
            extra,
            true,
        );
        let headers = m.build_headers(true).unwrap();
        let beta = headers
            .iter()
            .find(|(n, _)| n == "anthropic-beta")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(
            beta.matches("interleaved-thinking-2025-05-14").count(),
            1,
            "beta must be deduplicated: {beta}"
        );
        assert!(beta.contains("context-1m-2025-08-07"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let m = AnthropicModel::new(
            "claude-sonnet-4-5".into(),
            None,
            None,
            HashMap::new(),
            false,
        );
        assert!(m.build_headers(false).is_err());
    }

    // ── Body ──────────────────────────────────────────────────────────────────

    #[test]
    fn system_block_carries_cache_control() {
        let opts = StreamOptions {
            system: "be helpful".into(),
            ..StreamOptions::default()
        };
        let body = model().build_body(&opts);
        assert_eq!(body["system"][0]["text"], "be helpful");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn last_tool_definition_carries_cache_control() {
        let opts = StreamOptions {
            tools: vec![
                crate::ToolSchema {
                    name: "a".into(),
                    description: "".into(),
                    parameters: json!({}),
                },
                crate::ToolSchema {
                    name: "b".into(),
                    description: "".into(),
                    parameters: json!({}),
                },
            ],
            ..StreamOptions::default()
        };
        let body = model().build_body(&opts);
        assert!(body["tools"][0].get("cache_control").is_none());
        assert_eq!(body["tools"][1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn thinking_budget_from_provider_options() {
        let opts = StreamOptions {
            provider_options: json!({ "thinking": { "budget_tokens": 2000 } }),
            ..StreamOptions::default()
        };
        let body = model().build_body(&opts);
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 2000);
    }

    // ── Message serialization ─────────────────────────────────────────────────

    #[test]
    fn tool_role_message_becomes_user_tool_result() {
        let mut m = message(Role::Tool);
        m.add_tool_result(ToolResultPart {
            tool_call_id: "tc-1".into(),
            name: "view".into(),
            content: "file text".into(),
            is_error: false,
            metadata: Value::Null,
        });
        let wire = build_messages(&[m]);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["tool_use_id"], "tc-1");
    }

    #[test]
    fn unsigned_reasoning_is_not_replayed() {
        let mut m = message(Role::Assistant);
        m.append_reasoning("secret thoughts");
        m.append_text("answer");
        let wire = build_messages(&[m]);
        let blocks = wire[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"], "text");
    }

    #[test]
    fn signed_reasoning_is_replayed_as_thinking_block() {
        let mut m = message(Role::Assistant);
        m.append_reasoning("thoughts");
        m.finish_reasoning(Some("sig-abc".into()), Value::Null);
        m.append_text("answer");
        let wire = build_messages(&[m]);
        let blocks = wire[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[0]["signature"], "sig-abc");
    }

    #[test]
    fn cache_hint_marks_last_block() {
        let mut m = message(Role::User);
        m.append_text("question");
        m.cache_hint = true;
        let wire = build_messages(&[m]);
        let blocks = wire[0]["content"].as_array().unwrap();
        assert_eq!(
            blocks.last().unwrap()["cache_control"]["type"],
            "ephemeral"
        );
    }

    #[test]
    fn empty_shell_messages_are_skipped() {
        let mut shell = message(Role::Assistant);
        shell.set_finish(FinishReason::Canceled, String::new(), String::new());
        let wire = build_messages(&[shell]);
        assert!(wire.is_empty());
    }

    #[test]
    fn unfinished_tool_calls_are_not_serialized() {
        let mut m = message(Role::Assistant);
        m.add_tool_call("tc", "view");
        let wire = build_messages(&[m]);
        assert!(wire.is_empty(), "unfinished call must not reach the wire");
    }

    // ── SSE state machine ─────────────────────────────────────────────────────

    #[test]
    fn tool_use_block_lifecycle() {
        let mut state = SseState::default();
        let start = state
            .apply(&json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": { "type": "tool_use", "id": "toolu_01", "name": "view" }
            }))
            .unwrap();
        assert!(matches!(
            &start[0],
            StreamEvent::ToolInputStart { id, name } if id == "toolu_01" && name == "view"
        ));

        let delta = state
            .apply(&json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": { "type": "input_json_delta", "partial_json": "{\"path\":" }
            }))
            .unwrap();
        assert!(matches!(
            &delta[0],
            StreamEvent::ToolInputDelta { id, delta } if id == "toolu_01" && delta == "{\"path\":"
        ));

        let stop = state
            .apply(&json!({ "type": "content_block_stop", "index": 1 }))
            .unwrap();
        assert!(matches!(
            &stop[0],
            StreamEvent::ToolInputEnd { id } if id == "toolu_01"
        ));
    }

    #[test]
    fn thinking_block_collects_signature() {
        let mut state = SseState::default();
        state
            .apply(&json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "thinking" }
            }))
            .unwrap();
        let d = state
            .apply(&json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "thinking_delta", "thinking": "let me think" }
            }))
            .unwrap();
        assert!(matches!(&d[0], StreamEvent::ReasoningDelta(t) if t == "let me think"));
        state
            .apply(&json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "signature_delta", "signature": "EqRk" }
            }))
            .unwrap();
        let end = state
            .apply(&json!({ "type": "content_block_stop", "index": 0 }))
            .unwrap();
        assert!(matches!(
            &end[0],
            StreamEvent::ReasoningEnd { signature: Some(s), .. } if s == "EqRk"
        ));
    }

    #[test]
    fn usage_accumulates_across_start_and_delta() {
        let mut state = SseState::default();
        state
            .apply(&json!({
                "type": "message_start",
                "message": { "usage": {
                    "input_tokens": 100,
                    "cache_read_input_tokens": 80,
                    "cache_creation_input_tokens": 20
                } }
            }))
            .unwrap();
        state
            .apply(&json!({
                "type": "message_delta",
                "delta": { "stop_reason": "end_turn" },
                "usage": { "output_tokens": 42 }
            }))
            .unwrap();
        let finish = state.apply(&json!({ "type": "message_stop" })).unwrap();
        match &finish[0] {
            StreamEvent::StepFinish { reason, usage } => {
                assert_eq!(*reason, StopReason::Stop);
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.cache_read_tokens, 80);
                assert_eq!(usage.cache_creation_tokens, 20);
                assert_eq!(usage.output_tokens, 42);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_use_stop_reason_maps_to_tool_calls() {
        let mut state = SseState::default();
        state
            .apply(&json!({
                "type": "message_delta",
                "delta": { "stop_reason": "tool_use" }
            }))
            .unwrap();
        let finish = state.apply(&json!({ "type": "message_stop" })).unwrap();
        assert!(matches!(
            finish[0],
            StreamEvent::StepFinish { reason: StopReason::ToolCalls, .. }
        ));
    }

    #[test]
    fn max_tokens_maps_to_length() {
        let mut state = SseState::default();
        state
            .apply(&json!({
                "type": "message_delta",
                "delta": { "stop_reason": "max_tokens" }
            }))
            .unwrap();
        let finish = state.apply(&json!({ "type": "message_stop" })).unwrap();
        assert!(matches!(
            finish[0],
            StreamEvent::StepFinish { reason: StopReason::Length, .. }
        ));
    }

    #[test]
    fn error_event_is_fatal() {
        let mut state = SseState::default();
        let res = state.apply(&json!({
            "type": "error",
            "error": { "type": "overloaded_error", "message": "overloaded" }
        }));
        assert!(res.is_err());
    }

    #[test]
    fn ping_is_ignored() {
        let mut state = SseState::default();
        assert!(state.apply(&json!({ "type": "ping" })).unwrap().is_empty());
    }
}
