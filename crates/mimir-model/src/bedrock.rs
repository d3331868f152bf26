// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! AWS Bedrock driver — Converse API with bearer-token auth.
//!
//! Uses the non-streaming `POST /model/{modelId}/converse` endpoint and
//! wraps the response into the standard event stream.  Auth is the
//! Bedrock API-key bearer token (`AWS_BEARER_TOKEN_BEDROCK`); SigV4
//! request signing is out of scope for this driver.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};

use mimir_session::{Message, Part, Role};

use crate::{provider::EventStream, StopReason, StreamEvent, StreamOptions, Usage};

pub struct BedrockModel {
    model: String,
    token: Option<String>,
    region: String,
    client: reqwest::Client,
}

impl BedrockModel {
    pub fn new(model: String, token: Option<String>, region: String) -> Self {
        Self {
            model,
            token,
            region,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        // Model ids contain ':'; keep it URL-safe.
        let model = self.model.replace(':', "%3A");
        format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}/converse",
            self.region, model
        )
    }

    fn build_body(&self, opts: &StreamOptions) -> Value {
        let messages = build_converse_messages(&opts.messages);
        let mut body = json!({ "messages": messages });
        if !opts.system.is_empty() {
            body["system"] = json!([{ "text": opts.system }]);
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "toolSpec": {
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": { "json": t.parameters },
                        }
                    })
                })
                .collect();
            body["toolConfig"] = json!({ "tools": tools });
        }
        let mut inference = json!({});
        if let Some(cap) = opts.max_output_tokens {
            inference["maxTokens"] = json!(cap);
        }
        if let Some(t) = opts.temperature {
            inference["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            inference["topP"] = json!(p);
        }
        if inference.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
            body["inferenceConfig"] = inference;
        }
        body
    }
}

#[async_trait]
impl crate::LanguageModel for BedrockModel {
    fn provider_id(&self) -> &str {
        "bedrock"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream(&self, opts: StreamOptions) -> anyhow::Result<EventStream> {
        let token = self
            .token
            .as_deref()
            .context("AWS_BEARER_TOKEN_BEDROCK not set")?;
        let body = self.build_body(&opts);

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .context("bedrock request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("bedrock error {status}: {text}");
        }
        let v: Value = resp.json().await.context("bedrock response parse failed")?;

        let events = converse_to_events(&v)?;
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// Flatten a Converse response into the standard event sequence.
fn converse_to_events(v: &Value) -> anyhow::Result<Vec<StreamEvent>> {
    let mut events = Vec::new();

    let content = v["output"]["message"]["content"]
        .as_array()
        .ok_or_else(|| anyhow!("bedrock response missing output.message.content"))?;
    for block in content {
        if let Some(text) = block["text"].as_str() {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text.to_string()));
            }
        }
        if let Some(reasoning) = block["reasoningContent"]["reasoningText"].as_object() {
            if let Some(text) = reasoning.get("text").and_then(|t| t.as_str()) {
                events.push(StreamEvent::ReasoningDelta(text.to_string()));
                events.push(StreamEvent::ReasoningEnd {
                    signature: reasoning
                        .get("signature")
                        .and_then(|s| s.as_str())
                        .map(|s| s.to_string()),
                    metadata: Value::Null,
                });
            }
        }
        if let Some(tool_use) = block.get("toolUse") {
            let id = tool_use["toolUseId"].as_str().unwrap_or("").to_string();
            let name = tool_use["name"].as_str().unwrap_or("").to_string();
            let input = tool_use
                .get("input")
                .cloned()
                .unwrap_or_else(|| json!({}))
                .to_string();
            events.push(StreamEvent::ToolInputStart {
                id: id.clone(),
                name,
            });
            events.push(StreamEvent::ToolInputDelta {
                id: id.clone(),
                delta: input,
            });
            events.push(StreamEvent::ToolInputEnd { id });
        }
    }

    let reason = match v["stopReason"].as_str().unwrap_or("") {
        "end_turn" | "stop_sequence" => StopReason::Stop,
        "tool_use" => StopReason::ToolCalls,
        "max_tokens" => StopReason::Length,
        _ => StopReason::Unknown,
    };
    let usage = Usage {
        input_tokens: v["usage"]["inputTokens"].as_u64().unwrap_or(0),
        output_tokens: v["usage"]["outputTokens"].as_u64().unwrap_or(0),
        cache_read_tokens: v["usage"]["cacheReadInputTokens"].as_u64().unwrap_or(0),
        cache_creation_tokens: v["usage"]["cacheWriteInputTokens"].as_u64().unwrap_or(0),
    };
    events.push(StreamEvent::StepFinish { reason, usage });
    Ok(events)
}

/// Convert the message log to the Converse wire format.
fn build_converse_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for m in messages {
        if m.role == Role::System {
            continue;
        }
        let role = match m.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        let mut content: Vec<Value> = Vec::new();
        for p in &m.parts {
            match p {
                Part::Text { text } if !text.is_empty() => {
                    content.push(json!({ "text": text }));
                }
                Part::Binary { mime_type, data } => {
                    let format = mime_type.strip_prefix("image/").unwrap_or("png");
                    content.push(json!({
                        "image": { "format": format, "source": { "bytes": data } }
                    }));
                }
                Part::ToolCall(tc) if tc.finished => {
                    let input: Value =
                        serde_json::from_str(&tc.input).unwrap_or_else(|_| json!({}));
                    content.push(json!({
                        "toolUse": { "toolUseId": tc.id, "name": tc.name, "input": input }
                    }));
                }
                Part::ToolResult(tr) => {
                    let status = if tr.is_error { "error" } else { "success" };
                    content.push(json!({
                        "toolResult": {
                            "toolUseId": tr.tool_call_id,
                            "content": [{ "text": tr.content }],
                            "status": status,
                        }
                    }));
                }
                _ => {}
            }
        }
        if content.is_empty() {
            continue;
        }
        out.push(json!({ "role": role, "content": content }));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
