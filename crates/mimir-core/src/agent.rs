// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The per-session conversational control loop.
//!
//! One `SessionAgent` exists per agent role and serves any number of
//! sessions concurrently, with at most one loop per session id (enforced
//! by the active-requests map).  A `run` against a busy session enqueues
//! the prompt; queued prompts are drained into real user messages at the
//! next step boundary.
//!
//! Cancellation is cooperative through a per-run `CancellationToken`: the
//! provider stream and every tool run select against it.  Finalization
//! writes — synthesized tool results and the terminal Finish part — go
//! through the persistence services unconditionally, so the record
//! survives cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use mimir_model::{
    options::ResolvedSampling, LanguageModel, StopReason, StreamEvent, StreamOptions, Usage,
};
use mimir_permission::{PermissionRequest, PermissionService};
use mimir_session::{
    Attachment, FinishReason, Message, Messages, Part, Role, Sessions, ToolCallPart,
    ToolResultPart,
};
use mimir_tools::{AgentTool, ToolCall, ToolCtx, ToolSet};

use crate::prompts::summarizer_prompt;
use crate::title;

const CANCEL_ALL_WAIT: Duration = Duration::from_secs(5);
const CANCEL_ALL_POLL: Duration = Duration::from_millis(200);

/// Synthetic tool-result contents used when the loop must close the
/// tool-call/tool-result invariant on behalf of a call that never ran.
const CANCELED_TOOL_RESULT: &str = "Tool execution canceled by user";
const DENIED_TOOL_RESULT: &str = "Permission denied";
const ERRORED_TOOL_RESULT: &str = "There was an error while executing the tool";

/// A model handle plus its resolved per-model option bag, computed once
/// by the Coordinator.
#[derive(Clone)]
pub struct SelectedModel {
    pub handle: Arc<dyn LanguageModel>,
    pub provider_options: serde_json::Value,
    pub sampling: ResolvedSampling,
    pub max_output_tokens: Option<u32>,
}

impl SelectedModel {
    /// A model with no resolved options; used by tests and the title task.
    pub fn plain(handle: Arc<dyn LanguageModel>) -> Self {
        Self {
            handle,
            provider_options: serde_json::Value::Null,
            sampling: ResolvedSampling::default(),
            max_output_tokens: None,
        }
    }
}

/// The large/small model pair an agent drives.
#[derive(Clone)]
pub struct Models {
    pub large: SelectedModel,
    pub small: SelectedModel,
}

/// Input to one conversational turn.
#[derive(Clone)]
pub struct SessionAgentCall {
    pub session_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    /// Overrides the model's resolved provider options when set.
    pub provider_options: Option<serde_json::Value>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

impl SessionAgentCall {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            attachments: Vec::new(),
            provider_options: None,
            max_output_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Accumulated state of one streaming step.
#[derive(Default)]
struct StepState {
    usage: Usage,
    /// Results for provider-executed tool calls, buffered until the
    /// assistant message's Finish is written.
    provider_results: Vec<ToolResultPart>,
}

struct StepOutcome {
    reason: FinishReason,
    assistant: Message,
}

struct DispatchResult {
    denied: bool,
    canceled: bool,
}

pub struct SessionAgent {
    role: String,
    system_prompt: String,
    models: RwLock<Models>,
    tools: ToolSet,
    sessions: Sessions,
    messages: Messages,
    permissions: Arc<PermissionService>,
    working_dir: PathBuf,
    /// session id → cancel handle; presence marks the session busy.
    active: Mutex<HashMap<String, CancellationToken>>,
    /// session id → prompts queued while the session was busy.
    queue: Mutex<HashMap<String, Vec<SessionAgentCall>>>,
}

impl SessionAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: impl Into<String>,
        system_prompt: impl Into<String>,
        models: Models,
        tools: ToolSet,
        sessions: Sessions,
        messages: Messages,
        permissions: Arc<PermissionService>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            role: role.into(),
            system_prompt: system_prompt.into(),
            models: RwLock::new(models),
            tools,
            sessions,
            messages,
            permissions,
            working_dir,
            active: Mutex::new(HashMap::new()),
            queue: Mutex::new(HashMap::new()),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Hot-swap the model pair.  In-flight steps finish on the old models.
    pub async fn set_models(&self, models: Models) {
        *self.models.write().await = models;
    }

    /// Hot-swap the tool list.  In-flight steps keep their snapshot; the
    /// next step sees the new set.
    pub async fn set_tools(&self, tools: Vec<Arc<dyn AgentTool>>) {
        self.tools.replace(tools).await;
    }

    // ── Public loop API ──────────────────────────────────────────────────────

    /// Drive one conversational turn to completion and return the final
    /// assistant message.  Returns `Ok(None)` when the session was busy
    /// and the prompt was queued instead.
    pub async fn run(&self, call: SessionAgentCall) -> anyhow::Result<Option<Message>> {
        if call.session_id.is_empty() {
            anyhow::bail!("session id is required");
        }
        if call.prompt.trim().is_empty() {
            anyhow::bail!("prompt must not be empty");
        }
        let session_id = call.session_id.clone();

        let token = {
            let mut active = self.active.lock().await;
            if active.contains_key(&session_id) {
                debug!(session_id = %session_id, "session busy; queueing prompt");
                self.queue
                    .lock()
                    .await
                    .entry(session_id.clone())
                    .or_default()
                    .push(call);
                return Ok(None);
            }
            let token = CancellationToken::new();
            active.insert(session_id.clone(), token.clone());
            token
        };

        let result = self.process(call, &token).await;
        self.active.lock().await.remove(&session_id);
        result.map(Some)
    }

    /// Cooperatively cancel the session's in-flight loop (or summarize
    /// task) and purge its queue.  Idempotent.
    pub async fn cancel(&self, session_id: &str) {
        if let Some(token) = self.active.lock().await.get(session_id) {
            token.cancel();
        }
        self.queue.lock().await.remove(session_id);
    }

    /// Cancel every active session, then wait up to five seconds for the
    /// loops to drain.
    pub async fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> =
            self.active.lock().await.values().cloned().collect();
        for token in tokens {
            token.cancel();
        }
        self.queue.lock().await.clear();

        let deadline = tokio::time::Instant::now() + CANCEL_ALL_WAIT;
        while self.is_busy().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(CANCEL_ALL_POLL).await;
        }
    }

    pub async fn is_session_busy(&self, session_id: &str) -> bool {
        self.active.lock().await.contains_key(session_id)
    }

    pub async fn is_busy(&self) -> bool {
        !self.active.lock().await.is_empty()
    }

    pub async fn queued_prompts(&self, session_id: &str) -> usize {
        self.queue
            .lock()
            .await
            .get(session_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Purge the queue without cancelling the in-flight call.
    pub async fn clear_queue(&self, session_id: &str) {
        self.queue.lock().await.remove(session_id);
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    async fn process(
        &self,
        call: SessionAgentCall,
        token: &CancellationToken,
    ) -> anyhow::Result<Message> {
        let session_id = call.session_id.clone();
        // The session must exist; surfaces create it before running.
        self.sessions.get(&session_id).await?;

        self.create_user_message(&session_id, &call).await;

        // First user message of the session: kick off title generation in
        // the background on the small model.
        if self.messages.list(&session_id).await.len() == 1 {
            let small = self.models.read().await.small.clone();
            let sessions = self.sessions.clone();
            let sid = session_id.clone();
            let prompt = call.prompt.clone();
            tokio::spawn(async move {
                title::generate_title(small, sessions, sid, prompt).await;
            });
        }

        let mut last_assistant: Option<Message> = None;
        loop {
            // Step preparation: queued prompts become real user messages,
            // in submission order, before the model call.
            let queued = self
                .queue
                .lock()
                .await
                .remove(&session_id)
                .unwrap_or_default();
            for queued_call in queued {
                self.create_user_message(&session_id, &queued_call).await;
            }

            let outcome = self.step(&session_id, &call, token).await?;
            let reason = outcome.reason;
            last_assistant = Some(outcome.assistant);

            match reason {
                FinishReason::ToolUse => continue,
                FinishReason::EndTurn | FinishReason::Unknown => {
                    let more = self
                        .queue
                        .lock()
                        .await
                        .get(&session_id)
                        .map(|q| !q.is_empty())
                        .unwrap_or(false);
                    if more {
                        continue;
                    }
                    break;
                }
                // Terminal conditions: token limit, cancellation, denial,
                // stream failure.
                _ => break,
            }
        }

        last_assistant.context("conversation loop produced no assistant message")
    }

    async fn create_user_message(&self, session_id: &str, call: &SessionAgentCall) {
        let mut parts = vec![Part::Text {
            text: call.prompt.clone(),
        }];
        if !call.attachments.is_empty() {
            if self.models.read().await.large.handle.supports_images() {
                parts.extend(call.attachments.iter().cloned().map(Attachment::into_part));
            } else {
                warn!(
                    session_id = %session_id,
                    "dropping attachments: model does not support image input"
                );
            }
        }
        self.messages
            .create(session_id, Role::User, parts, None, None)
            .await;
    }

    /// One step: create the empty assistant message, stream the model
    /// response into it, then dispatch any requested tool calls.
    async fn step(
        &self,
        session_id: &str,
        call: &SessionAgentCall,
        token: &CancellationToken,
    ) -> anyhow::Result<StepOutcome> {
        let large = self.models.read().await.large.clone();
        let tools = self.tools.snapshot().await;

        let history = self.build_history(session_id).await?;
        let mut assistant = self
            .messages
            .create(
                session_id,
                Role::Assistant,
                vec![],
                Some(large.handle.model_id().to_string()),
                Some(large.handle.provider_id().to_string()),
            )
            .await;

        let opts = self.stream_options(call, &large, history, &tools);

        let mut state = StepState::default();
        let mut stream = match large.handle.stream(opts).await {
            Ok(s) => s,
            Err(e) => {
                self.finalize_failure(session_id, &mut assistant, &mut state, &e, false)
                    .await?;
                let reason = assistant.finish_reason().unwrap_or(FinishReason::Error);
                return Ok(StepOutcome { reason, assistant });
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.finalize_cancel(session_id, &mut assistant, &mut state)
                        .await?;
                    return Ok(StepOutcome {
                        reason: FinishReason::Canceled,
                        assistant,
                    });
                }
                event = stream.next() => event,
            };
            match event {
                None => break,
                Some(Ok(ev)) => {
                    self.apply_event(session_id, &mut assistant, ev, &mut state, &large)
                        .await?;
                }
                Some(Err(e)) => {
                    self.finalize_failure(session_id, &mut assistant, &mut state, &e, true)
                        .await?;
                    let reason = assistant.finish_reason().unwrap_or(FinishReason::Error);
                    return Ok(StepOutcome { reason, assistant });
                }
            }
        }

        // A well-behaved driver always ends with StepFinish; close the
        // message if one never arrived so it cannot remain non-terminal.
        if !assistant.is_finished() {
            assistant.set_finish(FinishReason::Unknown, String::new(), String::new());
            self.messages.update(assistant.clone()).await?;
        }

        let reason = assistant.finish_reason().unwrap_or(FinishReason::Unknown);
        if reason == FinishReason::ToolUse {
            let dispatch = self
                .dispatch_tools(session_id, &assistant, &mut state, &tools, token)
                .await?;
            if dispatch.denied {
                assistant.set_finish(FinishReason::PermissionDenied, String::new(), String::new());
                self.messages.update(assistant.clone()).await?;
                return Ok(StepOutcome {
                    reason: FinishReason::PermissionDenied,
                    assistant,
                });
            }
            if dispatch.canceled {
                assistant.set_finish(FinishReason::Canceled, String::new(), String::new());
                self.messages.update(assistant.clone()).await?;
                return Ok(StepOutcome {
                    reason: FinishReason::Canceled,
                    assistant,
                });
            }
            return Ok(StepOutcome {
                reason: FinishReason::ToolUse,
                assistant,
            });
        }

        // Provider-executed results with no local dispatch still need their
        // tool message, appended after the Finish was written.
        if !state.provider_results.is_empty() {
            self.write_tool_message(session_id, std::mem::take(&mut state.provider_results))
                .await;
        }

        Ok(StepOutcome { reason, assistant })
    }

    fn stream_options(
        &self,
        call: &SessionAgentCall,
        model: &SelectedModel,
        mut history: Vec<Message>,
        tools: &[Arc<dyn AgentTool>],
    ) -> StreamOptions {
        // Re-derive ephemeral cache hints: clear everything, then mark the
        // last two history messages.  The drivers themselves mark the
        // system prompt and the last tool definition.
        for m in history.iter_mut() {
            m.cache_hint = false;
        }
        let len = history.len();
        for m in history.iter_mut().skip(len.saturating_sub(2)) {
            m.cache_hint = true;
        }

        let schemas: Vec<mimir_model::ToolSchema> = tools
            .iter()
            .map(|t| mimir_model::ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect();

        StreamOptions {
            system: self.system_prompt.clone(),
            messages: history,
            tools: schemas,
            provider_options: call
                .provider_options
                .clone()
                .unwrap_or_else(|| model.provider_options.clone()),
            max_output_tokens: call.max_output_tokens.or(model.max_output_tokens),
            temperature: call.temperature.or(model.sampling.temperature),
            top_p: call.top_p.or(model.sampling.top_p),
            top_k: call.top_k.or(model.sampling.top_k),
            frequency_penalty: call
                .frequency_penalty
                .or(model.sampling.frequency_penalty),
            presence_penalty: call.presence_penalty.or(model.sampling.presence_penalty),
        }
    }

    /// History submitted to the provider: sliced at the summary message
    /// (role rewritten to User) when one exists, with cancelled-before-
    /// output assistant shells elided.  Reasoning parts are preserved.
    async fn build_history(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        let session = self.sessions.get(session_id).await?;
        let mut messages = self.messages.list(session_id).await;

        if let Some(summary_id) = &session.summary_message_id {
            if let Some(idx) = messages.iter().position(|m| m.id == *summary_id) {
                messages.drain(..idx);
                if let Some(summary) = messages.first_mut() {
                    summary.role = Role::User;
                }
            }
        }
        messages.retain(|m| !m.is_empty_shell());
        Ok(messages)
    }

    /// Apply one stream event: exactly one mutation of the assistant
    /// message and one persistence update.  `Retry` is observational.
    async fn apply_event(
        &self,
        session_id: &str,
        assistant: &mut Message,
        event: StreamEvent,
        state: &mut StepState,
        model: &SelectedModel,
    ) -> anyhow::Result<()> {
        match event {
            StreamEvent::ReasoningDelta(delta) => assistant.append_reasoning(&delta),
            StreamEvent::ReasoningEnd {
                signature,
                metadata,
            } => assistant.finish_reasoning(signature, metadata),
            StreamEvent::TextDelta(delta) => {
                // Text arriving closes any open reasoning block.
                assistant.finish_reasoning(None, serde_json::Value::Null);
                assistant.append_text(&delta);
            }
            StreamEvent::ToolInputStart { id, name } => assistant.add_tool_call(&id, &name),
            StreamEvent::ToolInputDelta { id, delta } => {
                assistant.append_tool_input(&id, &delta)
            }
            StreamEvent::ToolInputEnd { id } => assistant.finish_tool_call(&id),
            StreamEvent::ToolResult {
                tool_call_id,
                name,
                result,
                is_error,
            } => {
                assistant.mark_provider_executed(&tool_call_id);
                let content = match result {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                state.provider_results.push(ToolResultPart {
                    tool_call_id,
                    name,
                    content,
                    is_error,
                    metadata: serde_json::Value::Null,
                });
            }
            StreamEvent::StepFinish { reason, usage } => {
                assistant.set_finish(map_stop_reason(reason), String::new(), String::new());
                state.usage = usage;
                self.update_session_usage(session_id, model, &usage).await?;
            }
            StreamEvent::Retry { error, delay } => {
                warn!(
                    session_id = %session_id,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "provider retrying after transient failure"
                );
                return Ok(());
            }
        }
        self.messages.update(assistant.clone()).await?;
        Ok(())
    }

    /// Per-step cost accounting: convert usage to dollars with the
    /// model's catalog rates, accumulate into the session cost, and store
    /// the last step's token counters.
    async fn update_session_usage(
        &self,
        session_id: &str,
        model: &SelectedModel,
        usage: &Usage,
    ) -> anyhow::Result<()> {
        let mut session = self.sessions.get(session_id).await?;
        if let Some(entry) = model.handle.catalog() {
            session.cost += entry.step_cost(usage);
        }
        session.prompt_tokens = usage.input_tokens + usage.cache_creation_tokens;
        session.completion_tokens = usage.output_tokens + usage.cache_read_tokens;
        self.sessions.save(session).await?;
        Ok(())
    }

    // ── Tool dispatch ────────────────────────────────────────────────────────

    /// Execute the assistant's finished tool calls in order.  The first
    /// denial fails all later calls with denied results; cancellation
    /// fails the rest with canceled results.  Results are written as one
    /// Tool message after the assistant's Finish.
    async fn dispatch_tools(
        &self,
        session_id: &str,
        assistant: &Message,
        state: &mut StepState,
        tools: &[Arc<dyn AgentTool>],
        token: &CancellationToken,
    ) -> anyhow::Result<DispatchResult> {
        let calls: Vec<ToolCallPart> = assistant
            .tool_calls()
            .into_iter()
            .filter(|tc| tc.finished && !tc.provider_executed)
            .cloned()
            .collect();

        let mut results = std::mem::take(&mut state.provider_results);
        let mut denied = false;
        let mut canceled = false;

        for tc in calls {
            if canceled || token.is_cancelled() {
                canceled = true;
                results.push(synthetic_result(&tc, CANCELED_TOOL_RESULT));
                continue;
            }
            if denied {
                results.push(synthetic_result(&tc, DENIED_TOOL_RESULT));
                continue;
            }

            let tool = match tools.iter().find(|t| t.name() == tc.name) {
                Some(t) => t,
                None => {
                    results.push(synthetic_result(&tc, &format!("unknown tool: {}", tc.name)));
                    continue;
                }
            };
            let call = ToolCall {
                id: tc.id.clone(),
                name: tc.name.clone(),
                input: tc.input.clone(),
            };

            if let Some(probe) = tool.permission_request(&call) {
                let request = PermissionRequest {
                    session_id: session_id.to_string(),
                    tool_call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    action: probe.action,
                    path: self.working_dir.display().to_string(),
                    description: probe.description,
                    params: probe.params,
                };
                if !self.permissions.request(&request) {
                    debug!(
                        session_id = %session_id,
                        tool = %tc.name,
                        "permission denied; failing remaining calls"
                    );
                    denied = true;
                    results.push(synthetic_result(&tc, DENIED_TOOL_RESULT));
                    continue;
                }
            }

            let ctx = ToolCtx {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                root: self.working_dir.clone(),
                cancel: token.clone(),
            };
            let run = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    canceled = true;
                    results.push(synthetic_result(&tc, CANCELED_TOOL_RESULT));
                    continue;
                }
                run = tool.run(ctx, call) => run,
            };
            match run {
                Ok(resp) => results.push(ToolResultPart {
                    tool_call_id: tc.id.clone(),
                    name: tc.name.clone(),
                    content: resp.content,
                    is_error: resp.is_error,
                    metadata: resp.metadata,
                }),
                Err(_) if token.is_cancelled() => {
                    canceled = true;
                    results.push(synthetic_result(&tc, CANCELED_TOOL_RESULT));
                }
                Err(e) => {
                    results.push(synthetic_result(&tc, &e.to_string()));
                }
            }
        }

        if !results.is_empty() {
            self.write_tool_message(session_id, results).await;
        }
        Ok(DispatchResult { denied, canceled })
    }

    async fn write_tool_message(&self, session_id: &str, results: Vec<ToolResultPart>) {
        let parts: Vec<Part> = results.into_iter().map(Part::ToolResult).collect();
        self.messages
            .create(session_id, Role::Tool, parts, None, None)
            .await;
    }

    // ── Failure finalization ─────────────────────────────────────────────────

    /// Close out a step whose stream ended in cancellation: force-finish
    /// open tool calls, synthesize canceled results for the finished ones,
    /// and write `Finish(canceled)`.  These writes deliberately ignore the
    /// cancellation token.
    async fn finalize_cancel(
        &self,
        session_id: &str,
        assistant: &mut Message,
        state: &mut StepState,
    ) -> anyhow::Result<()> {
        self.finalize(
            session_id,
            assistant,
            state,
            FinishReason::Canceled,
            CANCELED_TOOL_RESULT,
            String::new(),
        )
        .await
    }

    /// Close out a step whose stream failed.  `mid_stream` distinguishes a
    /// failure after events were applied from a request that never
    /// started; both take the same invariant-preserving path.
    async fn finalize_failure(
        &self,
        session_id: &str,
        assistant: &mut Message,
        state: &mut StepState,
        error: &anyhow::Error,
        mid_stream: bool,
    ) -> anyhow::Result<()> {
        if mid_stream {
            warn!(session_id = %session_id, error = %error, "model stream failed");
        } else {
            warn!(session_id = %session_id, error = %error, "model request failed");
        }
        self.finalize(
            session_id,
            assistant,
            state,
            FinishReason::Error,
            ERRORED_TOOL_RESULT,
            error.to_string(),
        )
        .await
    }

    async fn finalize(
        &self,
        session_id: &str,
        assistant: &mut Message,
        state: &mut StepState,
        reason: FinishReason,
        synthetic_content: &str,
        details: String,
    ) -> anyhow::Result<()> {
        assistant.force_finish_tool_calls();

        let mut results = std::mem::take(&mut state.provider_results);
        let already: Vec<String> = results.iter().map(|r| r.tool_call_id.clone()).collect();
        for tc in assistant.tool_calls() {
            if tc.provider_executed || already.contains(&tc.id) {
                continue;
            }
            results.push(synthetic_result(tc, synthetic_content));
        }

        assistant.set_finish(reason, String::new(), details);
        self.messages.update(assistant.clone()).await?;
        if !results.is_empty() {
            self.write_tool_message(session_id, results).await;
        }
        Ok(())
    }

    // ── Summarizer ───────────────────────────────────────────────────────────

    /// Summarize the session with the large model.  Only permitted while
    /// the session is idle; the summarize task itself occupies the
    /// session's active slot so `cancel` reaches it.
    pub async fn summarize(&self, session_id: &str) -> anyhow::Result<()> {
        let token = {
            let mut active = self.active.lock().await;
            if active.contains_key(session_id) {
                anyhow::bail!("session is busy");
            }
            let token = CancellationToken::new();
            active.insert(session_id.to_string(), token.clone());
            token
        };
        let result = self.do_summarize(session_id, &token).await;
        self.active.lock().await.remove(session_id);
        result
    }

    async fn do_summarize(
        &self,
        session_id: &str,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let large = self.models.read().await.large.clone();
        let mut history = self.build_history(session_id).await?;

        // The summarize prompt is transient: it drives this stream but is
        // never persisted into the session log.
        let now = Utc::now();
        history.push(Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: Role::User,
            parts: vec![Part::Text {
                text: "Provide a detailed summary of our conversation above.".to_string(),
            }],
            model: None,
            provider: None,
            cache_hint: false,
            created_at: now,
            updated_at: now,
        });

        let mut assistant = self
            .messages
            .create(
                session_id,
                Role::Assistant,
                vec![],
                Some(large.handle.model_id().to_string()),
                Some(large.handle.provider_id().to_string()),
            )
            .await;

        let opts = StreamOptions {
            system: summarizer_prompt(),
            messages: history,
            provider_options: large.provider_options.clone(),
            max_output_tokens: large.max_output_tokens,
            temperature: large.sampling.temperature,
            ..StreamOptions::default()
        };

        let mut state = StepState::default();
        let mut stream = large.handle.stream(opts).await?;
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.finalize_cancel(session_id, &mut assistant, &mut state)
                        .await?;
                    anyhow::bail!("summarize canceled");
                }
                event = stream.next() => event,
            };
            match event {
                None => break,
                Some(Ok(ev)) => {
                    self.apply_event(session_id, &mut assistant, ev, &mut state, &large)
                        .await?;
                }
                Some(Err(e)) => {
                    self.finalize_failure(session_id, &mut assistant, &mut state, &e, true)
                        .await?;
                    return Err(e);
                }
            }
        }

        if assistant.text().is_empty() {
            anyhow::bail!("summarizer returned no text");
        }

        let mut session = self.sessions.get(session_id).await?;
        session.summary_message_id = Some(assistant.id.clone());
        session.completion_tokens = state.usage.output_tokens;
        session.prompt_tokens = 0;
        self.sessions.save(session).await?;
        Ok(())
    }
}

fn map_stop_reason(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::Stop => FinishReason::EndTurn,
        StopReason::Length => FinishReason::MaxTokens,
        StopReason::ToolCalls => FinishReason::ToolUse,
        StopReason::Unknown => FinishReason::Unknown,
    }
}

fn synthetic_result(tc: &ToolCallPart, content: &str) -> ToolResultPart {
    ToolResultPart {
        tool_call_id: tc.id.clone(),
        name: tc.name.clone(),
        content: content.to_string(),
        is_error: true,
        metadata: serde_json::Value::Null,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
