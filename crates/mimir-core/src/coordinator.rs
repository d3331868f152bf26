// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Coordinator: owns the session agents, builds providers and models
//! from config, assembles per-role tool sets (built-ins, the sub-agent
//! tool, MCP tools), and routes every user-visible call.
//!
//! The surface layer (TUI / CLI) talks only to this type.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::Context;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use mimir_config::{AgentRoleConfig, Config, ModelRef, ModelSelection};
use mimir_mcp::{McpEvent, McpManager, McpTool};
use mimir_model::options::{resolve_provider_options, resolve_sampling};
use mimir_permission::PermissionService;
use mimir_session::{Attachment, Message, Messages, Sessions};
use mimir_tools::{
    AgentTool, BashTool, FetchTool, GlobTool, GrepTool, LsTool, ToolSet, ViewTool,
};

use crate::agent::{Models, SelectedModel, SessionAgent, SessionAgentCall};
use crate::agent_tool::SubAgentTool;
use crate::prompts::{coder_prompt, task_prompt};

pub struct Coordinator {
    config: Arc<Config>,
    sessions: Sessions,
    messages: Messages,
    permissions: Arc<PermissionService>,
    mcp: Arc<McpManager>,
    models: RwLock<Models>,
    coder: Arc<SessionAgent>,
    working_dir: PathBuf,
    weak: Weak<Coordinator>,
}

impl Coordinator {
    pub async fn new(
        config: Arc<Config>,
        sessions: Sessions,
        messages: Messages,
        mcp: Arc<McpManager>,
    ) -> anyhow::Result<Arc<Self>> {
        let permissions = Arc::new(PermissionService::from_config(&config.permissions));
        let models = resolve_models(&config, &config.models)?;
        let working_dir = config
            .working_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let coder = Arc::new(SessionAgent::new(
            "coder",
            coder_prompt(),
            models.clone(),
            ToolSet::default(),
            sessions.clone(),
            messages.clone(),
            Arc::clone(&permissions),
            working_dir.clone(),
        ));

        let coordinator = Arc::new_cyclic(|weak| Self {
            config,
            sessions,
            messages,
            permissions,
            mcp,
            models: RwLock::new(models),
            coder,
            working_dir,
            weak: weak.clone(),
        });
        coordinator.refresh_tools().await;
        coordinator.spawn_mcp_watcher();
        Ok(coordinator)
    }

    // ── User-visible surface ─────────────────────────────────────────────────

    /// Run one prompt against the coder agent.  `Ok(None)` means the
    /// session was busy and the prompt was queued.
    pub async fn run(
        &self,
        session_id: &str,
        prompt: &str,
        attachments: Vec<Attachment>,
    ) -> anyhow::Result<Option<Message>> {
        let call =
            SessionAgentCall::new(session_id, prompt).with_attachments(attachments);
        self.coder.run(call).await
    }

    pub async fn cancel(&self, session_id: &str) {
        self.coder.cancel(session_id).await;
    }

    pub async fn cancel_all(&self) {
        self.coder.cancel_all().await;
    }

    pub async fn summarize(&self, session_id: &str) -> anyhow::Result<()> {
        self.coder.summarize(session_id).await
    }

    pub async fn is_session_busy(&self, session_id: &str) -> bool {
        self.coder.is_session_busy(session_id).await
    }

    pub async fn is_busy(&self) -> bool {
        self.coder.is_busy().await
    }

    pub async fn queued_prompts(&self, session_id: &str) -> usize {
        self.coder.queued_prompts(session_id).await
    }

    pub async fn clear_queue(&self, session_id: &str) {
        self.coder.clear_queue(session_id).await;
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    pub fn mcp(&self) -> &Arc<McpManager> {
        &self.mcp
    }

    pub(crate) fn coder_agent(&self) -> &Arc<SessionAgent> {
        &self.coder
    }

    /// Hot-swap the large/small model pair for all agents.
    pub async fn set_models(&self, selection: &ModelSelection) -> anyhow::Result<()> {
        let models = resolve_models(&self.config, selection)?;
        self.apply_models(models).await;
        Ok(())
    }

    pub(crate) async fn apply_models(&self, models: Models) {
        *self.models.write().await = models.clone();
        self.coder.set_models(models).await;
    }

    // ── Tool assembly ────────────────────────────────────────────────────────

    /// Rebuild the coder agent's tool set from config + MCP registry.
    /// Invoked at startup and whenever an MCP server republishes tools.
    pub async fn refresh_tools(&self) {
        let role = self.config.agent("coder");
        let tools = self.assemble_tools(&role).await;
        self.coder.tools().replace(tools).await;
    }

    async fn assemble_tools(&self, role: &AgentRoleConfig) -> Vec<Arc<dyn AgentTool>> {
        let mut tools: Vec<Arc<dyn AgentTool>> = vec![
            Arc::new(ViewTool),
            Arc::new(LsTool),
            Arc::new(GlobTool),
            Arc::new(GrepTool),
            Arc::new(BashTool::default()),
            Arc::new(FetchTool),
        ];
        if let Some(allowed) = &role.allowed_tools {
            tools.retain(|t| allowed.iter().any(|name| name == t.name()));
        }
        if role.agent_tool {
            tools.push(Arc::new(SubAgentTool::new(
                self.weak.clone(),
                self.sessions.clone(),
                Arc::clone(&self.permissions),
            )));
        }
        // MCP tools filtered by allowed_mcp: absent → all servers,
        // empty → none, present → listed only.
        for (server, def) in self.mcp.tools().await {
            let allowed = match &role.allowed_mcp {
                None => true,
                Some(list) => list.contains(&server),
            };
            if allowed {
                tools.push(Arc::new(McpTool::new(Arc::clone(&self.mcp), server, def)));
            }
        }
        tools
    }

    /// A fresh nested agent for one sub-agent invocation: task role,
    /// read-only tool set, the coordinator's current models.
    pub async fn new_task_agent(&self) -> Arc<SessionAgent> {
        let role = self.config.agent("task");
        let tools = self.assemble_tools(&role).await;
        let toolset = ToolSet::from_tools(tools).await;
        let models = self.models.read().await.clone();
        Arc::new(SessionAgent::new(
            "task",
            task_prompt(),
            models,
            toolset,
            self.sessions.clone(),
            self.messages.clone(),
            Arc::clone(&self.permissions),
            self.working_dir.clone(),
        ))
    }

    fn spawn_mcp_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut rx = self.mcp.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(McpEvent::ToolsListChanged { name }) => {
                        debug!(server = %name, "MCP tool list changed; rebuilding tool set");
                        match weak.upgrade() {
                            Some(coordinator) => coordinator.refresh_tools().await,
                            None => break,
                        }
                    }
                    Ok(McpEvent::StateChanged { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "MCP event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Resolve a `ModelRef` into a ready-to-use model: driver construction,
/// option-bag merge (catalog defaults → provider defaults → per-model
/// override) and sampling resolution.
fn resolve_model(config: &Config, model_ref: &ModelRef) -> anyhow::Result<SelectedModel> {
    let provider_cfg = config
        .providers
        .get(&model_ref.provider)
        .with_context(|| format!("unknown provider: {}", model_ref.provider))?;
    let handle = mimir_model::build_model(&config.providers, model_ref)?;
    let entry = handle.catalog();
    let provider_options = resolve_provider_options(
        provider_cfg.kind,
        entry.as_ref(),
        &provider_cfg.options,
        model_ref,
    );
    let sampling = resolve_sampling(model_ref, entry.as_ref());
    let max_output_tokens = model_ref
        .max_tokens
        .or_else(|| entry.as_ref().map(|e| e.max_output_tokens));
    Ok(SelectedModel {
        handle,
        provider_options,
        sampling,
        max_output_tokens,
    })
}

fn resolve_models(config: &Config, selection: &ModelSelection) -> anyhow::Result<Models> {
    Ok(Models {
        large: resolve_model(config, &selection.large)
            .context("resolving large model")?,
        small: resolve_model(config, &selection.small)
            .context("resolving small model")?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
