// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `agent` tool: delegates a focused task to a nested read-only
//! session agent in a child session.
//!
//! The tool holds a weak reference to the Coordinator and asks it for a
//! fresh task agent per invocation, so there is no ownership cycle from
//! the coder agent's tool set back to the coder agent.  The child session
//! id is derived deterministically from `(parent_message_id,
//! tool_call_id)`, which makes retried invocations land in the same
//! session instead of forking a duplicate.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use mimir_permission::PermissionService;
use mimir_session::Sessions;
use mimir_tools::{AgentTool, ToolCall, ToolCtx, ToolResponse};

use crate::agent::SessionAgentCall;
use crate::coordinator::Coordinator;

pub struct SubAgentTool {
    coordinator: Weak<Coordinator>,
    sessions: Sessions,
    permissions: Arc<PermissionService>,
}

impl SubAgentTool {
    pub fn new(
        coordinator: Weak<Coordinator>,
        sessions: Sessions,
        permissions: Arc<PermissionService>,
    ) -> Self {
        Self {
            coordinator,
            sessions,
            permissions,
        }
    }
}

#[async_trait]
impl AgentTool for SubAgentTool {
    fn name(&self) -> &str {
        "agent"
    }

    fn description(&self) -> &str {
        "Delegate a focused task to a sub-agent with read-only tools \
         (view, ls, glob, grep). The sub-agent investigates and returns a \
         single text report. Use it for self-contained research questions."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task for the sub-agent; must contain everything it needs, it cannot ask follow-ups"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn run(&self, ctx: ToolCtx, call: ToolCall) -> anyhow::Result<ToolResponse> {
        let prompt = match call.args().get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return Ok(ToolResponse::error("missing required parameter: prompt")),
        };
        if ctx.session_id.is_empty() || ctx.message_id.is_empty() {
            return Ok(ToolResponse::error(
                "session id and message id are required for the agent tool",
            ));
        }
        let coordinator = match self.coordinator.upgrade() {
            Some(c) => c,
            None => return Ok(ToolResponse::error("coordinator is shutting down")),
        };

        let child_id = Sessions::agent_tool_session_id(&ctx.message_id, &call.id);
        let child = self
            .sessions
            .create_task_session(&child_id, &ctx.session_id, "Agent tool session")
            .await;
        self.permissions.auto_approve_session(&child.id);
        debug!(
            parent = %ctx.session_id,
            child = %child.id,
            "spawning sub-agent session"
        );

        let agent = coordinator.new_task_agent().await;
        let sub_call = SessionAgentCall::new(child.id.clone(), prompt);

        // The nested loop runs as its own task.  Racing it directly
        // against the cancel token would drop the child's future mid-poll
        // when the dispatcher's own cancel race wins first, leaving the
        // child session with a non-terminal assistant message and
        // unresolved tool calls.  The child session is a real addressable
        // session, so its finalize-on-cancel writes must always run.
        let mut handle = {
            let agent = Arc::clone(&agent);
            let sessions = self.sessions.clone();
            let parent_id = ctx.session_id.clone();
            let child_id = child.id.clone();
            tokio::spawn(async move {
                let outcome = agent.run(sub_call).await;
                // Fold the child's spend into the parent inside the task,
                // so the roll-up happens even when the caller was dropped
                // by a cancellation race.
                if let Ok(child_session) = sessions.get(&child_id).await {
                    if let Ok(mut parent) = sessions.get(&parent_id).await {
                        parent.cost += child_session.cost;
                        let _ = sessions.save(parent).await;
                    }
                }
                outcome
            })
        };

        // Guard task: propagates parent cancellation to the child even
        // when this future itself is dropped before the branch below can
        // react.  Aborted on the normal path; on the cancel path it fires
        // once and exits on its own.
        let guard = {
            let agent = Arc::clone(&agent);
            let child_id = child.id.clone();
            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                agent.cancel(&child_id).await;
            })
        };

        let joined = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                agent.cancel(&child.id).await;
                // Wait for the child's own cancellation path to finish:
                // its assistant message gets a terminal Finish and every
                // dangling tool call a synthetic result before we return.
                (&mut handle).await
            }
            joined = &mut handle => joined,
        };
        guard.abort();

        if ctx.cancel.is_cancelled() {
            anyhow::bail!("tool execution canceled");
        }
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(anyhow::anyhow!("sub-agent task failed: {e}")),
        };

        match outcome {
            Ok(Some(message)) => {
                let text = message.text();
                if text.is_empty() {
                    Ok(ToolResponse::text("(sub-agent produced no text output)"))
                } else {
                    Ok(ToolResponse::text(text))
                }
            }
            Ok(None) => Ok(ToolResponse::error("sub-agent session was unexpectedly busy")),
            Err(e) => Ok(ToolResponse::error(format!("sub-agent error: {e}"))),
        }
    }
}
