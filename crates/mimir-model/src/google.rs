// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — `streamGenerateContent?alt=sse`.
//!
//! Two mutually exclusive init modes selected at construction:
//! - **Gemini API**: base URL + API key (`x-goog-api-key` header)
//! - **Vertex**: project + location, bearer token auth
//!
//! Gemini matches function responses to calls by *name*, not id, so the
//! request builder carries an id→name table across the message log.

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

enum Mode {
    Gemini { base_url: String },
    Vertex { project: String, location: String },
}

pub struct GoogleModel {
    model: String,
    api_key: Option<String>,
    mode: Mode,
    client: reqwest::Client,
}

impl GoogleModel {
    pub fn gemini(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            mode: Mode::Gemini {
                base_url: base_url
                    .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            },
            client: reqwest::Client::new(),
        }
    }

    pub fn vertex(model: String, api_key: Option<String>, project: &str, location: &str) -> Self {
        Self {
            model,
            api_key,
            mode: Mode::Vertex {
                project: project.to_string(),
                location: location.to_string(),
            },
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        match &self.mode {
            Mode::Gemini { base_url } => format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                base_url.trim_end_matches('/'),
                self.model
            ),
            Mode::Vertex { project, location } => format!(
                "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{}:streamGenerateContent?alt=sse",
                self.model
            ),
        }
    }

    fn auth_header(&self) -> anyhow::Result<(String, String)> {
        let key = self.api_key.as_deref().context("google API key not set")?;
        Ok(match &self.mode {
            Mode::Gemini { .. } => ("x-goog-api-key".into(), key.to_string()),
            Mode::Vertex { .. } => ("Authorization".into(), format!("Bearer {key}")),
        })
    }

    fn build_body(&self, opts: &StreamOptions) -> Value {
        let contents = build_contents(&opts.messages);
        let mut body = json!({ "contents": contents });

        if !opts.system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": opts.system }] });
        }
        if !opts.tools.is_empty() {
            let decls: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
        }

        let mut gen = json!({});
        if let Some(cap) = opts.max_output_tokens {
            gen["maxOutputTokens"] = json!(cap);
        }
        if let Some(t) = opts.temperature {
            gen["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            gen["topP"] = json!(p);
        }
        if let Some(k) = opts.top_k {
            gen["topK"] = json!(k);
        }
        let thinking = &opts.provider_options["thinking_config"];
        if !thinking.is_null() {
            let mut cfg = json!({});
            if let Some(budget) = thinking["thinking_budget"].as_u64() {
                cfg["thinkingBudget"] = json!(budget);
            }
            if let Some(include) = thinking["include_thoughts"].as_bool() {
                cfg["includeThoughts"] = json!(include);
            }
            gen["thinkingConfig"] = cfg;
        }
        if gen.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
            body["generationConfig"] = gen;
        }
        body
    }
}

#[async_trait]
impl crate::LanguageModel for GoogleModel {
    fn provider_id(&self) -> &str {
        "google"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream(&self, opts: StreamOptions) -> anyhow::Result<EventStream> {
        let body = self.build_body(&opts);
        let auth = self.auth_header()?;
        let url = self.endpoint();
        let client = self.client.clone();

        let stream = try_stream! {
            let mut attempt = 0u32;
            let resp = loop {
                let resp = client
                    .post(&url)
                    .header(auth.0.as_str(), auth.1.as_str())
                    .json(&body)
                    .send()
                    .await
                    .context("google request failed")?;
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
                        error: format!("google {status}: {text}"),
                        delay,
                    };
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    Err(anyhow!("google error {status}: {text}"))?;
                    unreachable!();
                }
                break resp;
            };

            let mut bytes = resp.bytes_stream();
            let mut buf = String::new();
            let mut state = SseState::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.context("google stream read failed")?;
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            for ev in state.apply(&v) {
                                yield ev;
                            }
                        }
                    }
                }
            }
            // Gemini has no [DONE] marker; the step ends with the stream.
            yield StreamEvent::StepFinish {
                reason: state.reason(),
                usage: state.usage,
            };
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Default)]
struct SseState {
    usage: Usage,
    finish: Option<StopReason>,
    saw_function_call: bool,
    call_seq: u64,
}

impl SseState {
    fn reason(&self) -> StopReason {
        if self.saw_function_call {
            return StopReason::ToolCalls;
        }
        self.finish.unwrap_or(StopReason::Unknown)
    }

    fn apply(&mut self, v: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(meta) = v.get("usageMetadata") {
            let cached = meta["cachedContentTokenCount"].as_u64().unwrap_or(0);
            let prompt = meta["promptTokenCount"].as_u64().unwrap_or(0);
            self.usage.input_tokens = prompt.saturating_sub(cached);
            self.usage.cache_read_tokens = cached;
            self.usage.output_tokens = meta["candidatesTokenCount"].as_u64().unwrap_or(0);
        }

        let candidate = &v["candidates"][0];
        if let Some(reason) = candidate["finishReason"].as_str() {
            self.finish = Some(match reason {
                "STOP" => StopReason::Stop,
                "MAX_TOKENS" => StopReason::Length,
                _ => StopReason::Unknown,
            });
        }

        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    if text.is_empty() {
                        continue;
                    }
                    if part["thought"].as_bool().unwrap_or(false) {
                        events.push(StreamEvent::ReasoningDelta(text.to_string()));
                    } else {
                        events.push(StreamEvent::TextDelta(text.to_string()));
                    }
                }
                if let Some(fc) = part.get("functionCall") {
                    // Gemini delivers calls whole, not as input deltas.
                    self.saw_function_call = true;
                    self.call_seq += 1;
                    let id = format!("call_{}", self.call_seq);
                    let name = fc["name"].as_str().unwrap_or("").to_string();
                    let args = fc
                        .get("args")
                        .cloned()
                        .unwrap_or_else(|| json!({}))
                        .to_string();
                    events.push(StreamEvent::ToolInputStart {
                        id: id.clone(),
                        name,
                    });
                    events.push(StreamEvent::ToolInputDelta {
                        id: id.clone(),
                        delta: args,
                    });
                    events.push(StreamEvent::ToolInputEnd { id });
                }
            }
        }
        events
    }
}

/// Convert the message log to Gemini `contents`.
fn build_contents(messages: &[Message]) -> Vec<Value> {
    // Function responses reference calls by name; build the id→name table
    // over the whole log first.
    let mut call_names: HashMap<String, String> = HashMap::new();
    for m in messages {
        for tc in m.tool_calls() {
            call_names.insert(tc.id.clone(), tc.name.clone());
        }
    }

    let mut out: Vec<Value> = Vec::new();
    for m in messages {
        if m.role == Role::System {
            continue;
        }
        let role = match m.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let mut parts: Vec<Value> = Vec::new();
        for p in &m.parts {
            match p {
                Part::Text { text } if !text.is_empty() => {
                    parts.push(json!({ "text": text }));
                }
                Part::Binary { mime_type, data } => {
                    parts.push(json!({
                        "inlineData": { "mimeType": mime_type, "data": data }
                    }));
                }
                Part::ImageUrl { url } => {
                    parts.push(json!({
                        "fileData": { "fileUri": url }
                    }));
                }
                Part::ToolCall(tc) if tc.finished => {
                    let args: Value =
                        serde_json::from_str(&tc.input).unwrap_or_else(|_| json!({}));
                    parts.push(json!({
                        "functionCall": { "name": tc.name, "args": args }
                    }));
                }
                Part::ToolResult(tr) => {
                    let name = call_names
                        .get(&tr.tool_call_id)
                        .cloned()
                        .unwrap_or_else(|| tr.name.clone());
                    parts.push(json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "result": tr.content },
                        }
                    }));
                }
                _ => {}
            }
        }
        if parts.is_empty() {
            continue;
        }
        out.push(json!({ "role": role, "parts": parts }));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
