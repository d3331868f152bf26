// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    catalog::ModelCatalogEntry, provider::EventStream, StopReason, StreamEvent,
    StreamOptions, Usage,
};

/// Deterministic mock driver for tests.  Echoes the last user message text
/// back as the assistant response.
#[derive(Default)]
pub struct MockModel;

#[async_trait]
impl crate::LanguageModel for MockModel {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, opts: StreamOptions) -> anyhow::Result<EventStream> {
        let reply = opts
            .messages
            .iter()
            .rev()
            .find(|m| m.role == mimir_session::Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());
        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::StepFinish {
                reason: StopReason::Stop,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                    ..Usage::default()
                },
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted stream item: either a normal event or an injected failure.
#[derive(Debug, Clone)]
pub enum Scripted {
    Event(StreamEvent),
    /// The stream yields this as a fatal error at this position.
    Error(String),
}

impl From<StreamEvent> for Scripted {
    fn from(ev: StreamEvent) -> Self {
        Scripted::Event(ev)
    }
}

/// A pre-scripted model.  Each `stream` call pops the next script off the
/// front of the queue, so tests can express exact multi-step event
/// sequences — tool calls, reasoning, failures — without network access.
pub struct ScriptedModel {
    scripts: Arc<Mutex<Vec<Vec<Scripted>>>>,
    entry: Option<ModelCatalogEntry>,
    vision: bool,
    /// Every `StreamOptions` this model has seen, in call order.  Tests
    /// inspect this to assert on the submitted history.
    pub calls: Arc<Mutex<Vec<StreamOptions>>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<Scripted>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            entry: None,
            vision: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach catalog metadata (cost rates, context window) so cost
    /// accounting paths are exercised.
    pub fn with_catalog(mut self, entry: ModelCatalogEntry) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Declare image support so attachments are not stripped before the
    /// request reaches this model.
    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    fn step_finish(reason: StopReason) -> Scripted {
        Scripted::Event(StreamEvent::StepFinish {
            reason,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Usage::default()
            },
        })
    }

    /// Convenience: a model that always answers with one text step.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            StreamEvent::TextDelta(r).into(),
            Self::step_finish(StopReason::Stop),
        ]])
    }

    /// Convenience: one tool-call step followed by a text step.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let id = tool_id.into();
        Self::new(vec![
            vec![
                StreamEvent::ToolInputStart {
                    id: id.clone(),
                    name: tool_name.into(),
                }
                .into(),
                StreamEvent::ToolInputDelta {
                    id: id.clone(),
                    delta: args_json.into(),
                }
                .into(),
                StreamEvent::ToolInputEnd { id }.into(),
                Self::step_finish(StopReason::ToolCalls),
            ],
            vec![
                StreamEvent::TextDelta(final_text.into()).into(),
                Self::step_finish(StopReason::Stop),
            ],
        ])
    }

    /// Convenience: one step issuing several parallel tool calls, followed
    /// by a text step.
    pub fn parallel_tools_then_text(
        calls: Vec<(String, String, String)>,
        final_text: impl Into<String>,
    ) -> Self {
        let mut step: Vec<Scripted> = Vec::new();
        for (id, name, args) in calls {
            step.push(
                StreamEvent::ToolInputStart {
                    id: id.clone(),
                    name,
                }
                .into(),
            );
            step.push(
                StreamEvent::ToolInputDelta {
                    id: id.clone(),
                    delta: args,
                }
                .into(),
            );
            step.push(StreamEvent::ToolInputEnd { id }.into());
        }
        step.push(Self::step_finish(StopReason::ToolCalls));
        Self::new(vec![
            step,
            vec![
                StreamEvent::TextDelta(final_text.into()).into(),
                Self::step_finish(StopReason::Stop),
            ],
        ])
    }

    /// How many scripts remain unconsumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl crate::LanguageModel for ScriptedModel {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        "scripted-mock"
    }

    fn catalog(&self) -> Option<ModelCatalogEntry> {
        self.entry.clone()
    }

    fn supports_images(&self) -> bool {
        self.vision
    }

    async fn stream(&self, opts: StreamOptions) -> anyhow::Result<EventStream> {
        self.calls.lock().unwrap().push(opts);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    StreamEvent::TextDelta("[no more scripts]".into()).into(),
                    Self::step_finish(StopReason::Stop),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = script
            .into_iter()
            .map(|s| match s {
                Scripted::Event(ev) => Ok(ev),
                Scripted::Error(msg) => Err(anyhow::anyhow!(msg)),
            })
            .collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
