// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared base implementation for OpenAI-compatible chat completion APIs.
//!
//! `openai`, `openai-compat`, `openrouter`, and `azure` all speak the same
//! `/chat/completions` SSE wire format; each configures this driver with
//! its own URL layout, auth style, and headers.
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (most providers)
//! - `ApiKeyHeader` — `api-key: <key>` (Azure OpenAI)
//! - `None` — no authentication (local servers)

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use mimir_session::{Message, Part, Role};

use crate::{
    provider::EventStream, retry_delay, retryable_status, StopReason, StreamEvent,
    StreamOptions, Usage, MAX_STREAM_RETRIES,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
    None,
}

pub struct OpenAiCompatModel {
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
    /// JSON object whose keys are set-paths (`a.b.c`) applied to the
    /// request body after everything else, so users can reach parameters
    /// the driver does not model natively.
    extra_body: Value,
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
        extra_body: Value,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            extra_headers,
            auth_style,
            extra_body,
            client: reqwest::Client::new(),
        }
    }

    /// Construct from a pre-built chat completions URL.  Azure encodes the
    /// deployment and api-version as path/query segments, so the URL cannot
    /// be derived by appending a fixed suffix.
    pub fn with_full_chat_url(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        chat_url: impl Into<String>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
        extra_body: Value,
    ) -> Self {
        Self {
            driver_name,
            model,
            api_key,
            chat_url: chat_url.into(),
            extra_headers,
            auth_style,
            extra_body,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, opts: &StreamOptions) -> Value {
        let messages = build_openai_messages(&opts.system, &opts.messages);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        // OpenAI renamed the cap for current models; other compatible
        // providers still use max_tokens.
        let max_tokens_key = if self.driver_name == "openai" {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        if let Some(cap) = opts.max_output_tokens {
            body[max_tokens_key] = json!(cap);
        }

        // Reasoning models reject the sampling knobs entirely.
        let sampling_allowed = !(self.driver_name == "openai"
            && (self.model.starts_with("o1")
                || self.model.starts_with("o3")
                || self.model.starts_with("gpt-5")));
        if sampling_allowed {
            if let Some(t) = opts.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = opts.top_p {
                body["top_p"] = json!(p);
            }
            if let Some(f) = opts.frequency_penalty {
                body["frequency_penalty"] = json!(f);
            }
            if let Some(p) = opts.presence_penalty {
                body["presence_penalty"] = json!(p);
            }
        }

        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        // Merged provider options go in flat; user extra_body set-paths win
        // over everything.
        if let Some(map) = opts.provider_options.as_object() {
            for (k, v) in map {
                body[k.as_str()] = v.clone();
            }
        }
        if let Some(map) = self.extra_body.as_object() {
            for (k, v) in map {
                set_path(&mut body, k, v.clone());
            }
        }
        body
    }

    fn auth_headers(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        match self.auth_style {
            AuthStyle::Bearer => {
                let key = self.api_key.as_deref().with_context(|| {
                    format!("{} API key not set", self.driver_name)
                })?;
                headers.push(("Authorization".to_string(), format!("Bearer {key}")));
            }
            AuthStyle::ApiKeyHeader => {
                let key = self.api_key.as_deref().with_context(|| {
                    format!("{} API key not set", self.driver_name)
                })?;
                headers.push(("api-key".to_string(), key.to_string()));
            }
            AuthStyle::None => {}
        }
        headers.extend(self.extra_headers.iter().cloned());
        Ok(headers)
    }
}

#[async_trait]
impl crate::LanguageModel for OpenAiCompatModel {
    fn provider_id(&self) -> &str {
        self.driver_name
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream(&self, opts: StreamOptions) -> anyhow::Result<EventStream> {
        let body = self.build_body(&opts);
        let headers = self.auth_headers()?;
        let url = self.chat_url.clone();
        let client = self.client.clone();
        let driver = self.driver_name;

        let stream = try_stream! {
            let mut attempt = 0u32;
            let resp = loop {
                let mut rb = client.post(&url).json(&body);
                for (name, value) in &headers {
                    rb = rb.header(name.as_str(), value.as_str());
                }
                let resp = rb
                    .send()
                    .await
                    .with_context(|| format!("{driver} request failed"))?;
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
                        error: format!("{driver} {status}: {text}"),
                        delay,
                    };
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    Err(anyhow!("{driver} error {status}: {text}"))?;
                    unreachable!();
                }
                break resp;
            };

            let mut bytes = resp.bytes_stream();
            let mut buf = String::new();
            let mut state = SseState::default();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.with_context(|| format!("{driver} stream read failed"))?;
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    let data = match line.strip_prefix("data: ") {
                        Some(d) => d.trim().to_string(),
                        None => continue,
                    };
                    if data == "[DONE]" {
                        for ev in state.finish() {
                            yield ev;
                        }
                        break 'read;
                    }
                    if let Ok(v) = serde_json::from_str::<Value>(&data) {
                        for ev in state.apply(&v) {
                            yield ev;
                        }
                    }
                }
            }
            if !state.finished {
                // Stream ended without [DONE]; close out what we have.
                for ev in state.finish() {
                    yield ev;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Set a dotted path (`a.b.c`) inside a JSON object, creating intermediate
/// objects as needed.
fn set_path(body: &mut Value, path: &str, value: Value) {
    let mut current = body;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, seg) in segments.iter().enumerate() {
        if i == segments.len() - 1 {
            current[*seg] = value;
            return;
        }
        if !current[*seg].is_object() {
            current[*seg] = json!({});
        }
        current = &mut current[*seg];
    }
}

/// Stateful SSE translation for the chat-completions chunk format.
/// Tool-call chunks are interleaved by index; ids arrive only on the first
/// chunk of each call, so the index→id table is carried across events.
#[derive(Default)]
struct SseState {
    tool_ids: HashMap<u64, String>,
    open_order: Vec<String>,
    usage: Usage,
    reason: StopReason,
    synthetic_seq: u64,
    finished: bool,
}

impl SseState {
    fn apply(&mut self, v: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            let cached = usage["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0);
            let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
            self.usage.input_tokens = prompt.saturating_sub(cached);
            self.usage.cache_read_tokens = cached;
            self.usage.output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.reason = match reason {
                "stop" => StopReason::Stop,
                "length" => StopReason::Length,
                "tool_calls" => StopReason::ToolCalls,
                _ => StopReason::Unknown,
            };
        }

        let delta = &choice["delta"];
        let reasoning = delta["reasoning_content"]
            .as_str()
            .or_else(|| delta["reasoning"].as_str());
        if let Some(r) = reasoning {
            if !r.is_empty() {
                events.push(StreamEvent::ReasoningDelta(r.to_string()));
            }
        }
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text.to_string()));
            }
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for tc in calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                if !self.tool_ids.contains_key(&index) {
                    // First chunk of this call; some gateways omit the id.
                    let id = match tc["id"].as_str().filter(|s| !s.is_empty()) {
                        Some(id) => id.to_string(),
                        None => {
                            self.synthetic_seq += 1;
                            format!("call_synthetic_{}", self.synthetic_seq)
                        }
                    };
                    let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                    self.tool_ids.insert(index, id.clone());
                    self.open_order.push(id.clone());
                    events.push(StreamEvent::ToolInputStart { id, name });
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        if let Some(id) = self.tool_ids.get(&index) {
                            events.push(StreamEvent::ToolInputDelta {
                                id: id.clone(),
                                delta: args.to_string(),
                            });
                        }
                    }
                }
            }
        }
        events
    }

    /// Close all open tool calls and emit the terminal StepFinish.
    fn finish(&mut self) -> Vec<StreamEvent> {
        self.finished = true;
        let mut events: Vec<StreamEvent> = self
            .open_order
            .drain(..)
            .map(|id| StreamEvent::ToolInputEnd { id })
            .collect();
        events.push(StreamEvent::StepFinish {
            reason: self.reason,
            usage: self.usage,
        });
        events
    }
}

/// Convert the message log to the chat-completions wire format.
///
/// Reasoning parts are not replayed (the API has no surface for them);
/// each ToolResult part becomes its own `tool` role message.
pub(crate) fn build_openai_messages(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    if !system.is_empty() {
        out.push(json!({ "role": "system", "content": system }));
    }
    for m in messages {
        match m.role {
            Role::System => {
                out.push(json!({ "role": "system", "content": m.text() }));
            }
            Role::User => {
                let images: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ImageUrl { url } => {
                            Some(json!({ "type": "image_url", "image_url": { "url": url } }))
                        }
                        Part::Binary { mime_type, data } => Some(json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{mime_type};base64,{data}") }
                        })),
                        _ => None,
                    })
                    .collect();
                if images.is_empty() {
                    out.push(json!({ "role": "user", "content": m.text() }));
                } else {
                    let mut parts = vec![json!({ "type": "text", "text": m.text() })];
                    parts.extend(images);
                    out.push(json!({ "role": "user", "content": parts }));
                }
            }
            Role::Assistant => {
                let text = m.text();
                let tool_calls: Vec<Value> = m
                    .tool_calls()
                    .iter()
                    .filter(|tc| tc.finished && !tc.provider_executed)
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.input },
                        })
                    })
                    .collect();
                if text.is_empty() && tool_calls.is_empty() {
                    continue;
                }
                let mut msg = json!({ "role": "assistant" });
                msg["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    json!(text)
                };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                out.push(msg);
            }
            Role::Tool => {
                for tr in m.tool_results() {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": tr.tool_call_id,
                        "content": tr.content,
                    }));
                }
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
