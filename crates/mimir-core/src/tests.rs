// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests for the session agent loop.
//!
//! Every scenario is driven by scripted models, so runs are deterministic
//! and need no network access.

use std::path::PathBuf;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mimir_config::PermissionConfig;
use mimir_model::{
    catalog, EventStream, LanguageModel, MockModel, Scripted, ScriptedModel, StopReason,
    StreamEvent, StreamOptions, Usage,
};
use mimir_permission::PermissionService;
use mimir_session::{FinishReason, Messages, Role, Sessions};
use mimir_tools::{AgentTool, GlobTool, LsTool, ToolSet, ViewTool};

use crate::agent::{Models, SelectedModel, SessionAgent, SessionAgentCall};

// ── Harness ──────────────────────────────────────────────────────────────────

fn allow_all() -> Arc<PermissionService> {
    Arc::new(PermissionService::from_config(&PermissionConfig::default()))
}

fn deny_tools(denied: &[&str]) -> Arc<PermissionService> {
    Arc::new(PermissionService::from_config(&PermissionConfig {
        deny: denied.iter().map(|s| s.to_string()).collect(),
        ..PermissionConfig::default()
    }))
}

struct Harness {
    agent: Arc<SessionAgent>,
    sessions: Sessions,
    messages: Messages,
}

async fn harness(
    model: Arc<dyn LanguageModel>,
    tools: Vec<Arc<dyn AgentTool>>,
    permissions: Arc<PermissionService>,
    working_dir: PathBuf,
) -> Harness {
    let sessions = Sessions::new();
    let messages = Messages::new();
    let models = Models {
        large: SelectedModel::plain(model),
        small: SelectedModel::plain(Arc::new(MockModel)),
    };
    let agent = Arc::new(SessionAgent::new(
        "coder",
        "You are a coding assistant under test.",
        models,
        ToolSet::from_tools(tools).await,
        sessions.clone(),
        messages.clone(),
        permissions,
        working_dir,
    ));
    Harness {
        agent,
        sessions,
        messages,
    }
}

async fn simple_harness(model: Arc<dyn LanguageModel>) -> Harness {
    harness(model, vec![], allow_all(), PathBuf::from(".")).await
}

/// A model whose first stream pauses at a gate so tests can interact with
/// a session while it is demonstrably busy.
struct GatedModel {
    started: Arc<Notify>,
    gate: Arc<Notify>,
    call_count: std::sync::Mutex<usize>,
    pub calls: Arc<std::sync::Mutex<Vec<StreamOptions>>>,
}

impl GatedModel {
    fn new(started: Arc<Notify>, gate: Arc<Notify>) -> Self {
        Self {
            started,
            gate,
            call_count: std::sync::Mutex::new(0),
            calls: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl LanguageModel for GatedModel {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        "gated-mock"
    }

    async fn stream(&self, opts: StreamOptions) -> anyhow::Result<EventStream> {
        self.calls.lock().unwrap().push(opts);
        let call = {
            let mut count = self.call_count.lock().unwrap();
            *count += 1;
            *count
        };
        let started = Arc::clone(&self.started);
        let gate = Arc::clone(&self.gate);
        let s = stream! {
            if call == 1 {
                yield Ok(StreamEvent::TextDelta("answer A".into()));
                started.notify_one();
                gate.notified().await;
            } else {
                yield Ok(StreamEvent::TextDelta("answer BC".into()));
            }
            yield Ok(StreamEvent::StepFinish {
                reason: StopReason::Stop,
                usage: Usage::default(),
            });
        };
        Ok(Box::pin(s))
    }
}

/// A model whose stream emits some content then hangs until cancelled.
struct HangingModel {
    started: Arc<Notify>,
    with_tool_call: bool,
}

#[async_trait]
impl LanguageModel for HangingModel {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        "hanging-mock"
    }

    async fn stream(&self, _opts: StreamOptions) -> anyhow::Result<EventStream> {
        let started = Arc::clone(&self.started);
        let with_tool_call = self.with_tool_call;
        let s = stream! {
            yield Ok(StreamEvent::TextDelta("partial".into()));
            if with_tool_call {
                yield Ok(StreamEvent::ToolInputStart {
                    id: "tc-hang".into(),
                    name: "view".into(),
                });
            }
            started.notify_one();
            futures::future::pending::<()>().await;
            unreachable!();
        };
        Ok(Box::pin(s))
    }
}

// ── S1: Hello ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s1_hello_produces_user_and_assistant() {
    let h = simple_harness(Arc::new(ScriptedModel::always_text("Hello there!"))).await;
    let session = h.sessions.create("s1").await;

    let result = h
        .agent
        .run(SessionAgentCall::new(&session.id, "Hello"))
        .await
        .unwrap();
    let assistant = result.expect("idle session runs immediately");

    let msgs = h.messages.list(&session.id).await;
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].role, Role::User);
    assert_eq!(msgs[1].role, Role::Assistant);
    assert_eq!(assistant.finish_reason(), Some(FinishReason::EndTurn));
    assert!(assistant.tool_calls().is_empty());
    assert_eq!(assistant.text(), "Hello there!");
}

#[tokio::test]
async fn empty_prompt_is_rejected() {
    let h = simple_harness(Arc::new(ScriptedModel::always_text("x"))).await;
    let session = h.sessions.create("s").await;
    let err = h
        .agent
        .run(SessionAgentCall::new(&session.id, "   "))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("prompt"));
}

#[tokio::test]
async fn missing_session_id_is_rejected() {
    let h = simple_harness(Arc::new(ScriptedModel::always_text("x"))).await;
    let err = h
        .agent
        .run(SessionAgentCall::new("", "hi"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("session id"));
}

#[tokio::test]
async fn unknown_session_is_an_error() {
    let h = simple_harness(Arc::new(ScriptedModel::always_text("x"))).await;
    let err = h
        .agent
        .run(SessionAgentCall::new("no-such-session", "hi"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("session not found"));
}

// ── S2: Read a file ──────────────────────────────────────────────────────────

#[tokio::test]
async fn s2_view_tool_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("go.mod"),
        "module example.com/testproject\n\ngo 1.22\n",
    )
    .unwrap();

    let model = Arc::new(ScriptedModel::tool_then_text(
        "tc-1",
        "view",
        r#"{"path":"go.mod"}"#,
        "The module is example.com/testproject.",
    ));
    let h = harness(
        model,
        vec![Arc::new(ViewTool)],
        allow_all(),
        dir.path().to_path_buf(),
    )
    .await;
    let session = h.sessions.create("s2").await;

    h.agent
        .run(SessionAgentCall::new(&session.id, "Read the go mod"))
        .await
        .unwrap();

    let msgs = h.messages.list(&session.id).await;
    let with_call = msgs
        .iter()
        .find(|m| m.tool_calls().iter().any(|tc| tc.name == "view"))
        .expect("assistant message with view tool call");
    assert_eq!(with_call.finish_reason(), Some(FinishReason::ToolUse));

    let tool_msg = msgs
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message follows the assistant message");
    let result = &tool_msg.tool_results()[0];
    assert_eq!(result.tool_call_id, "tc-1");
    assert!(!result.is_error);
    assert!(result.content.contains("module example.com/testproject"));

    // The loop continued to a final text step.
    let last = msgs.last().unwrap();
    assert_eq!(last.finish_reason(), Some(FinishReason::EndTurn));
}

// ── S3: Parallel tools ───────────────────────────────────────────────────────

#[tokio::test]
async fn s3_parallel_tool_calls_both_resolve() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();

    let model = Arc::new(ScriptedModel::parallel_tools_then_text(
        vec![
            ("c1".into(), "glob".into(), r#"{"pattern":"**/*.go"}"#.into()),
            ("c2".into(), "ls".into(), "{}".into()),
        ],
        "Both done.",
    ));
    let h = harness(
        model,
        vec![Arc::new(GlobTool), Arc::new(LsTool)],
        allow_all(),
        dir.path().to_path_buf(),
    )
    .await;
    let session = h.sessions.create("s3").await;

    h.agent
        .run(SessionAgentCall::new(
            &session.id,
            "glob all .go files and ls the directory, in parallel",
        ))
        .await
        .unwrap();

    let msgs = h.messages.list(&session.id).await;
    let with_calls = msgs
        .iter()
        .find(|m| m.tool_calls().len() >= 2)
        .expect("assistant message with two tool calls");
    let calls = with_calls.tool_calls();
    assert_ne!(calls[0].id, calls[1].id);
    for call in &calls {
        assert!(["glob", "ls"].contains(&call.name.as_str()));
    }

    let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
    let results = tool_msg.tool_results();
    assert_eq!(results.len(), 2);
    for result in results {
        assert!(!result.is_error, "{}: {}", result.name, result.content);
        assert!(
            result.content.contains("main.go"),
            "{} output missing main.go: {}",
            result.name,
            result.content
        );
    }
}

// ── S4: Permission denied ────────────────────────────────────────────────────

#[tokio::test]
async fn s4_denied_tool_fails_remaining_calls_and_turn() {
    let model = Arc::new(ScriptedModel::parallel_tools_then_text(
        vec![
            ("c1".into(), "bash".into(), r#"{"command":"echo 1"}"#.into()),
            ("c2".into(), "bash".into(), r#"{"command":"echo 2"}"#.into()),
        ],
        "never reached",
    ));
    let h = harness(
        model,
        vec![Arc::new(mimir_tools::BashTool::default())],
        deny_tools(&["bash"]),
        PathBuf::from("."),
    )
    .await;
    let session = h.sessions.create("s4").await;

    let assistant = h
        .agent
        .run(SessionAgentCall::new(&session.id, "run both"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        assistant.finish_reason(),
        Some(FinishReason::PermissionDenied)
    );
    let msgs = h.messages.list(&session.id).await;
    let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
    let results = tool_msg.tool_results();
    assert_eq!(results.len(), 2, "both calls must receive results");
    for result in results {
        assert_eq!(result.content, "Permission denied");
        assert!(result.is_error);
    }
}

// ── S5: Cancel mid-stream ────────────────────────────────────────────────────

#[tokio::test]
async fn s5_cancel_mid_stream_finalizes_and_frees_session() {
    let started = Arc::new(Notify::new());
    let model = Arc::new(HangingModel {
        started: Arc::clone(&started),
        with_tool_call: true,
    });
    let h = simple_harness(model).await;
    let session = h.sessions.create("s5").await;

    let agent = Arc::clone(&h.agent);
    let sid = session.id.clone();
    let handle =
        tokio::spawn(async move { agent.run(SessionAgentCall::new(&sid, "long task")).await });

    started.notified().await;
    assert!(h.agent.is_session_busy(&session.id).await);
    h.agent.cancel(&session.id).await;

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("loop must end within five seconds")
        .unwrap()
        .unwrap();
    assert!(!h.agent.is_session_busy(&session.id).await);

    let assistant = result.unwrap();
    assert_eq!(assistant.finish_reason(), Some(FinishReason::Canceled));
    assert_eq!(assistant.text(), "partial", "streamed text must survive");
    // The unfinished tool call was force-finished and closed with a
    // synthetic error result.
    let calls = assistant.tool_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].finished);
    assert_eq!(calls[0].input, "{}");

    let msgs = h.messages.list(&session.id).await;
    let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
    let result = &tool_msg.tool_results()[0];
    assert_eq!(result.tool_call_id, "tc-hang");
    assert_eq!(result.content, "Tool execution canceled by user");
    assert!(result.is_error);
}

#[tokio::test]
async fn cancel_is_idempotent_and_safe_on_idle_sessions() {
    let h = simple_harness(Arc::new(ScriptedModel::always_text("x"))).await;
    let session = h.sessions.create("idle").await;
    h.agent.cancel(&session.id).await;
    h.agent.cancel(&session.id).await;
    assert!(!h.agent.is_session_busy(&session.id).await);
}

// ── S6: Queue coalescing ─────────────────────────────────────────────────────

#[tokio::test]
async fn s6_queued_prompts_drain_in_order_into_one_step() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let model = Arc::new(GatedModel::new(Arc::clone(&started), Arc::clone(&gate)));
    let calls = Arc::clone(&model.calls);
    let h = simple_harness(model).await;
    let session = h.sessions.create("s6").await;

    let agent = Arc::clone(&h.agent);
    let sid = session.id.clone();
    let handle = tokio::spawn(async move { agent.run(SessionAgentCall::new(&sid, "A")).await });

    started.notified().await;
    // While A streams, B and C are queued, not run.
    let queued_b = h
        .agent
        .run(SessionAgentCall::new(&session.id, "B"))
        .await
        .unwrap();
    let queued_c = h
        .agent
        .run(SessionAgentCall::new(&session.id, "C"))
        .await
        .unwrap();
    assert!(queued_b.is_none());
    assert!(queued_c.is_none());
    assert_eq!(h.agent.queued_prompts(&session.id).await, 2);

    gate.notify_one();
    handle.await.unwrap().unwrap();

    let msgs = h.messages.list(&session.id).await;
    let user_texts: Vec<String> = msgs
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.text())
        .collect();
    assert_eq!(user_texts, vec!["A", "B", "C"]);
    let assistants = msgs.iter().filter(|m| m.role == Role::Assistant).count();
    assert_eq!(assistants, 2, "exactly one extra step for B+C");

    // The second model call saw B and C as real user messages, in order.
    let recorded = calls.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    let second_users: Vec<String> = recorded[1]
        .messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.text())
        .collect();
    assert_eq!(second_users, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn clear_queue_discards_pending_prompts() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let model = Arc::new(GatedModel::new(Arc::clone(&started), Arc::clone(&gate)));
    let h = simple_harness(model).await;
    let session = h.sessions.create("clear").await;

    let agent = Arc::clone(&h.agent);
    let sid = session.id.clone();
    let handle = tokio::spawn(async move { agent.run(SessionAgentCall::new(&sid, "A")).await });

    started.notified().await;
    h.agent
        .run(SessionAgentCall::new(&session.id, "B"))
        .await
        .unwrap();
    assert_eq!(h.agent.queued_prompts(&session.id).await, 1);
    h.agent.clear_queue(&session.id).await;
    assert_eq!(h.agent.queued_prompts(&session.id).await, 0);

    gate.notify_one();
    handle.await.unwrap().unwrap();

    let msgs = h.messages.list(&session.id).await;
    let assistants = msgs.iter().filter(|m| m.role == Role::Assistant).count();
    assert_eq!(assistants, 1, "cleared prompt must not trigger a step");
}

// ── Failure handling ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_error_synthesizes_results_and_error_finish() {
    let model = Arc::new(ScriptedModel::new(vec![vec![
        StreamEvent::ToolInputStart {
            id: "tc-1".into(),
            name: "view".into(),
        }
        .into(),
        Scripted::Error("quota exhausted".into()),
    ]]));
    let h = simple_harness(model).await;
    let session = h.sessions.create("err").await;

    let assistant = h
        .agent
        .run(SessionAgentCall::new(&session.id, "go"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(assistant.finish_reason(), Some(FinishReason::Error));
    let finish_details = assistant
        .parts
        .iter()
        .find_map(|p| match p {
            mimir_session::Part::Finish { details, .. } => Some(details.clone()),
            _ => None,
        })
        .unwrap();
    assert!(finish_details.contains("quota exhausted"));

    let calls = assistant.tool_calls();
    assert!(calls[0].finished, "open call must be force-finished");
    assert_eq!(calls[0].input, "{}");

    let msgs = h.messages.list(&session.id).await;
    let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(
        tool_msg.tool_results()[0].content,
        "There was an error while executing the tool"
    );
}

#[tokio::test]
async fn max_tokens_ends_the_turn() {
    let model = Arc::new(ScriptedModel::new(vec![vec![
        StreamEvent::TextDelta("truncat".into()).into(),
        StreamEvent::StepFinish {
            reason: StopReason::Length,
            usage: Usage::default(),
        }
        .into(),
    ]]));
    let h = simple_harness(model).await;
    let session = h.sessions.create("max").await;
    let assistant = h
        .agent
        .run(SessionAgentCall::new(&session.id, "go"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assistant.finish_reason(), Some(FinishReason::MaxTokens));
}

#[tokio::test]
async fn unknown_tool_yields_error_result_and_loop_continues() {
    let model = Arc::new(ScriptedModel::tool_then_text(
        "tc-1",
        "missing_tool",
        "{}",
        "recovered",
    ));
    let h = simple_harness(model).await;
    let session = h.sessions.create("unknown").await;

    let assistant = h
        .agent
        .run(SessionAgentCall::new(&session.id, "go"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assistant.finish_reason(), Some(FinishReason::EndTurn));
    assert_eq!(assistant.text(), "recovered");

    let msgs = h.messages.list(&session.id).await;
    let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
    let result = &tool_msg.tool_results()[0];
    assert!(result.is_error);
    assert!(result.content.contains("unknown tool"));
}

// ── Invariants: tool calls always resolve, exactly one Finish ────────────────

#[tokio::test]
async fn every_finished_tool_call_has_exactly_one_result() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
    let model = Arc::new(ScriptedModel::parallel_tools_then_text(
        vec![
            ("c1".into(), "glob".into(), r#"{"pattern":"*.go"}"#.into()),
            ("c2".into(), "ls".into(), "{}".into()),
        ],
        "done",
    ));
    let h = harness(
        model,
        vec![Arc::new(GlobTool), Arc::new(LsTool)],
        allow_all(),
        dir.path().to_path_buf(),
    )
    .await;
    let session = h.sessions.create("inv").await;
    h.agent
        .run(SessionAgentCall::new(&session.id, "go"))
        .await
        .unwrap();

    let msgs = h.messages.list(&session.id).await;
    for (i, m) in msgs.iter().enumerate() {
        for tc in m.tool_calls().iter().filter(|tc| tc.finished) {
            let matching: usize = msgs[i..]
                .iter()
                .filter(|later| later.role == Role::Tool)
                .flat_map(|later| later.tool_results())
                .filter(|tr| tr.tool_call_id == tc.id)
                .count();
            assert_eq!(matching, 1, "call {} must have exactly one result", tc.id);
        }
    }
    for m in msgs.iter().filter(|m| m.role == Role::Assistant) {
        let finishes = m
            .parts
            .iter()
            .filter(|p| matches!(p, mimir_session::Part::Finish { .. }))
            .count();
        assert_eq!(finishes, 1);
    }
}

// ── Cost accounting ──────────────────────────────────────────────────────────

#[tokio::test]
async fn session_cost_accumulates_and_never_decreases() {
    let entry = catalog::lookup("anthropic", "claude-sonnet-4-5").unwrap();
    let model = Arc::new(
        ScriptedModel::tool_then_text("tc-1", "missing", "{}", "done").with_catalog(entry),
    );
    let h = simple_harness(model).await;
    let session = h.sessions.create("cost").await;

    h.agent
        .run(SessionAgentCall::new(&session.id, "go"))
        .await
        .unwrap();
    let after_first = h.sessions.get(&session.id).await.unwrap();
    assert!(after_first.cost > 0.0, "two steps must bill");

    h.agent
        .run(SessionAgentCall::new(&session.id, "again"))
        .await
        .unwrap();
    let after_second = h.sessions.get(&session.id).await.unwrap();
    assert!(after_second.cost > after_first.cost);
    // Last-step counters, not accumulated: usage is 10 in / 5 out.
    assert_eq!(after_second.prompt_tokens, 10);
    assert_eq!(after_second.completion_tokens, 5);
}

// ── Summarization & history windowing ────────────────────────────────────────

#[tokio::test]
async fn summarize_sets_pointer_and_next_run_starts_at_summary_as_user() {
    let h = simple_harness(Arc::new(ScriptedModel::always_text("first answer"))).await;
    let session = h.sessions.create("sum").await;
    h.agent
        .run(SessionAgentCall::new(&session.id, "hello"))
        .await
        .unwrap();

    // Swap in a model scripted for the summary stream.
    let summary_model = Arc::new(ScriptedModel::always_text("the summary"));
    h.agent
        .set_models(Models {
            large: SelectedModel::plain(summary_model),
            small: SelectedModel::plain(Arc::new(MockModel)),
        })
        .await;
    h.agent.summarize(&session.id).await.unwrap();

    let saved = h.sessions.get(&session.id).await.unwrap();
    let summary_id = saved.summary_message_id.clone().expect("pointer set");
    assert_eq!(saved.prompt_tokens, 0);
    assert_eq!(saved.completion_tokens, 5);

    // The next run must submit a history starting AT the summary message,
    // rewritten to the user role.
    let next_model = Arc::new(ScriptedModel::always_text("post-summary answer"));
    let calls = Arc::clone(&next_model.calls);
    h.agent
        .set_models(Models {
            large: SelectedModel::plain(next_model),
            small: SelectedModel::plain(Arc::new(MockModel)),
        })
        .await;
    h.agent
        .run(SessionAgentCall::new(&session.id, "continue"))
        .await
        .unwrap();

    let recorded = calls.lock().unwrap();
    let history = &recorded[0].messages;
    assert_eq!(history[0].id, summary_id);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text(), "the summary");
}

#[tokio::test]
async fn summarize_refuses_busy_session() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let model = Arc::new(GatedModel::new(Arc::clone(&started), Arc::clone(&gate)));
    let h = simple_harness(model).await;
    let session = h.sessions.create("busy").await;

    let agent = Arc::clone(&h.agent);
    let sid = session.id.clone();
    let handle = tokio::spawn(async move { agent.run(SessionAgentCall::new(&sid, "A")).await });
    started.notified().await;

    let err = h.agent.summarize(&session.id).await.unwrap_err();
    assert!(err.to_string().contains("busy"));

    gate.notify_one();
    handle.await.unwrap().unwrap();
}

// ── Cancellation liveness across the whole agent ─────────────────────────────

#[tokio::test]
async fn cancel_all_drains_every_session() {
    let started = Arc::new(Notify::new());
    let model = Arc::new(HangingModel {
        started: Arc::clone(&started),
        with_tool_call: false,
    });
    let h = simple_harness(model).await;
    let session = h.sessions.create("all").await;

    let agent = Arc::clone(&h.agent);
    let sid = session.id.clone();
    let handle = tokio::spawn(async move { agent.run(SessionAgentCall::new(&sid, "go")).await });
    started.notified().await;
    assert!(h.agent.is_busy().await);

    h.agent.cancel_all().await;
    assert!(!h.agent.is_busy().await);
    handle.await.unwrap().unwrap();
}

// ── Elision of cancelled-before-output shells ────────────────────────────────

#[tokio::test]
async fn empty_assistant_shells_are_elided_from_history() {
    // First stream dies instantly (no output at all), second succeeds.
    let model = Arc::new(ScriptedModel::new(vec![
        vec![Scripted::Error("connection reset".into())],
        vec![
            StreamEvent::TextDelta("fine now".into()).into(),
            StreamEvent::StepFinish {
                reason: StopReason::Stop,
                usage: Usage::default(),
            }
            .into(),
        ],
    ]));
    let calls = Arc::clone(&model.calls);
    let h = simple_harness(model).await;
    let session = h.sessions.create("shell").await;

    // First run ends with an Error finish and an empty assistant shell.
    let assistant = h
        .agent
        .run(SessionAgentCall::new(&session.id, "first"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assistant.finish_reason(), Some(FinishReason::Error));

    // Second run: the dead shell must not be submitted to the provider.
    h.agent
        .run(SessionAgentCall::new(&session.id, "second"))
        .await
        .unwrap();
    let recorded = calls.lock().unwrap();
    let second_history = &recorded[1].messages;
    assert!(
        second_history.iter().all(|m| !m.is_empty_shell()),
        "empty assistant shells must be elided"
    );
}

// ── Cache hints ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn cache_hints_mark_last_two_history_messages() {
    let model = Arc::new(ScriptedModel::always_text("ok"));
    let calls = Arc::clone(&model.calls);
    let h = simple_harness(model).await;
    let session = h.sessions.create("cache").await;
    h.agent
        .run(SessionAgentCall::new(&session.id, "one"))
        .await
        .unwrap();

    let model2 = Arc::new(ScriptedModel::always_text("ok again"));
    let calls2 = Arc::clone(&model2.calls);
    h.agent
        .set_models(Models {
            large: SelectedModel::plain(model2),
            small: SelectedModel::plain(Arc::new(MockModel)),
        })
        .await;
    h.agent
        .run(SessionAgentCall::new(&session.id, "two"))
        .await
        .unwrap();

    // First call: single message, hinted.
    {
        let recorded = calls.lock().unwrap();
        let history = &recorded[0].messages;
        assert!(history.last().unwrap().cache_hint);
    }
    // Second call: exactly the last two messages carry the hint.
    let recorded = calls2.lock().unwrap();
    let history = &recorded[0].messages;
    assert!(history.len() >= 3);
    let hinted: Vec<bool> = history.iter().map(|m| m.cache_hint).collect();
    let len = hinted.len();
    for (i, is_hinted) in hinted.iter().enumerate() {
        assert_eq!(*is_hinted, i >= len - 2, "position {i} of {len}");
    }
}

// ── Sub-agent tool ───────────────────────────────────────────────────────────

/// A coordinator wired to the mock provider, for sub-agent tool tests.
async fn mock_coordinator() -> (Arc<crate::Coordinator>, Sessions, Messages) {
    use mimir_mcp::McpManager;

    let mut providers = std::collections::HashMap::new();
    providers.insert(
        "mock".to_string(),
        mimir_config::ProviderConfig {
            kind: mimir_config::ProviderKind::Mock,
            ..mimir_config::ProviderConfig::default()
        },
    );
    let model_ref = mimir_config::ModelRef {
        provider: "mock".into(),
        model: "mock-model".into(),
        ..mimir_config::ModelRef::default()
    };
    let config = Arc::new(mimir_config::Config {
        providers,
        models: mimir_config::ModelSelection {
            large: model_ref.clone(),
            small: model_ref,
        },
        ..mimir_config::Config::default()
    });
    let sessions = Sessions::new();
    let messages = Messages::new();
    let mcp = McpManager::start(std::collections::HashMap::new()).await;
    let coordinator =
        crate::Coordinator::new(config, sessions.clone(), messages.clone(), mcp)
            .await
            .unwrap();
    (coordinator, sessions, messages)
}

#[tokio::test]
async fn sub_agent_tool_runs_child_session_idempotently() {
    use mimir_tools::{ToolCall, ToolCtx};

    let (coordinator, sessions, _messages) = mock_coordinator().await;
    let parent = sessions.create("parent").await;
    let tool = coordinator
        .coder_agent()
        .tools()
        .snapshot()
        .await
        .into_iter()
        .find(|t| t.name() == "agent")
        .expect("agent tool assembled");

    let ctx = ToolCtx {
        session_id: parent.id.clone(),
        message_id: "assistant-msg-1".into(),
        root: PathBuf::from("."),
        cancel: CancellationToken::new(),
    };
    let call = ToolCall {
        id: "call-7".into(),
        name: "agent".into(),
        input: r#"{"prompt":"investigate the build"}"#.into(),
    };

    let resp = tool.run(ctx.clone(), call.clone()).await.unwrap();
    assert!(!resp.is_error);
    assert!(resp.content.contains("investigate the build"));

    let child_id = Sessions::agent_tool_session_id("assistant-msg-1", "call-7");
    let child = sessions.get(&child_id).await.unwrap();
    assert_eq!(child.parent_session_id.as_deref(), Some(parent.id.as_str()));

    // Same (message, call) pair resolves to the same child session.
    let before = sessions.list().await.len();
    let resp2 = tool.run(ctx, call).await.unwrap();
    assert!(!resp2.is_error);
    assert_eq!(sessions.list().await.len(), before, "no duplicate session");
}

#[tokio::test]
async fn cancelling_agent_tool_lets_child_session_finalize() {
    use mimir_tools::{ToolCall, ToolCtx};

    let (coordinator, sessions, messages) = mock_coordinator().await;
    // The child agent must hang mid-stream so the cancel races a live loop.
    let started = Arc::new(Notify::new());
    coordinator
        .apply_models(Models {
            large: SelectedModel::plain(Arc::new(HangingModel {
                started: Arc::clone(&started),
                with_tool_call: true,
            })),
            small: SelectedModel::plain(Arc::new(MockModel)),
        })
        .await;

    let parent = sessions.create("parent").await;
    let tool = coordinator
        .coder_agent()
        .tools()
        .snapshot()
        .await
        .into_iter()
        .find(|t| t.name() == "agent")
        .expect("agent tool assembled");

    let cancel = CancellationToken::new();
    let ctx = ToolCtx {
        session_id: parent.id.clone(),
        message_id: "assistant-msg-9".into(),
        root: PathBuf::from("."),
        cancel: cancel.clone(),
    };
    let call = ToolCall {
        id: "call-9".into(),
        name: "agent".into(),
        input: r#"{"prompt":"dig into the crash"}"#.into(),
    };

    let handle = tokio::spawn(async move { tool.run(ctx, call).await });
    started.notified().await;
    cancel.cancel();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("agent tool must return after cancel")
        .unwrap();
    assert!(result.is_err(), "cancellation surfaces as Err to the dispatcher");

    // The child loop's own cancellation path must have run to completion:
    // terminal Finish on the assistant message, the dangling call closed,
    // and a synthetic result written.
    let child_id = Sessions::agent_tool_session_id("assistant-msg-9", "call-9");
    let child_msgs = messages.list(&child_id).await;
    let assistant = child_msgs
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .expect("child assistant message exists");
    assert_eq!(assistant.finish_reason(), Some(FinishReason::Canceled));
    assert_eq!(assistant.text(), "partial");
    let calls = assistant.tool_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].finished, "dangling call must be force-finished");
    let tool_msg = child_msgs
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("synthetic result message exists");
    let result = &tool_msg.tool_results()[0];
    assert_eq!(result.content, "Tool execution canceled by user");
    assert!(result.is_error);
}
