// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::tool::AgentTool;

/// A tool schema — mirrors `mimir_model::ToolSchema` but keeps the tools
/// crate independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The shared, hot-swappable tool list.
///
/// The Coordinator owns the contents and replaces them when MCP servers
/// publish tool-list changes; the Session Agent snapshots the list at the
/// start of every step.  Tools are kept sorted by name so the schemas sent
/// to providers are deterministic.
#[derive(Clone, Default)]
pub struct ToolSet {
    inner: Arc<RwLock<Vec<Arc<dyn AgentTool>>>>,
}

impl ToolSet {
    pub async fn from_tools(tools: Vec<Arc<dyn AgentTool>>) -> Self {
        let set = Self::default();
        set.replace(tools).await;
        set
    }

    fn sorted(mut tools: Vec<Arc<dyn AgentTool>>) -> Vec<Arc<dyn AgentTool>> {
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Swap the entire tool list.  In-flight steps keep the snapshot they
    /// took; the next step sees the new set.
    pub async fn replace(&self, tools: Vec<Arc<dyn AgentTool>>) {
        *self.inner.write().await = Self::sorted(tools);
    }

    pub async fn snapshot(&self) -> Vec<Arc<dyn AgentTool>> {
        self.inner.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.inner
            .read()
            .await
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    pub async fn schemas(&self) -> Vec<ToolSchema> {
        self.inner
            .read()
            .await
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
