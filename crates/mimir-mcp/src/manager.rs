// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Connection manager for configured MCP servers.
//!
//! Owns all MCP state — clients, per-server connection state, and the
//! event broker — on one object with deterministic teardown.  Startup
//! initializes every non-disabled server in parallel under its configured
//! timeout.  Before each tool call the server is pinged; a failed ping
//! tears the client down and rebuilds it exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use mimir_config::{McpServerConfig, McpTransportKind};

use crate::protocol::{
    initialize_params, CallToolResult, McpToolDef, ToolsListResult, NOTIFICATION_TOOLS_CHANGED,
};
use crate::transport::{HttpTransport, McpError, SseTransport, StdioTransport, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpState {
    Disabled,
    Starting,
    Connected,
    Error(String),
}

#[derive(Debug, Clone)]
pub enum McpEvent {
    StateChanged { name: String, state: McpState },
    ToolsListChanged { name: String },
}

struct ClientEntry {
    transport: Arc<dyn Transport>,
    tools: Vec<McpToolDef>,
}

pub struct McpManager {
    configs: HashMap<String, McpServerConfig>,
    clients: RwLock<HashMap<String, Arc<ClientEntry>>>,
    states: RwLock<HashMap<String, McpState>>,
    events: broadcast::Sender<McpEvent>,
    weak: Weak<McpManager>,
}

impl McpManager {
    /// Initialize every configured server in parallel and return the
    /// manager.  Failures are recorded per server, never fatal.
    pub async fn start(configs: HashMap<String, McpServerConfig>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let manager = Arc::new_cyclic(|weak| Self {
            configs,
            clients: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            events,
            weak: weak.clone(),
        });

        let mut tasks = Vec::new();
        for (name, cfg) in manager.configs.clone() {
            let m = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                m.init_server(&name, &cfg).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        manager
    }

    async fn init_server(&self, name: &str, cfg: &McpServerConfig) {
        if cfg.disabled {
            self.set_state(name, McpState::Disabled).await;
            return;
        }
        self.set_state(name, McpState::Starting).await;
        match timeout(
            Duration::from_secs(cfg.timeout_secs),
            self.connect(name, cfg),
        )
        .await
        {
            Ok(Ok(entry)) => {
                info!(server = name, tool_count = entry.tools.len(), "MCP server connected");
                self.clients
                    .write()
                    .await
                    .insert(name.to_string(), Arc::new(entry));
                self.set_state(name, McpState::Connected).await;
            }
            Ok(Err(e)) => {
                warn!(server = name, error = %e, "MCP server failed to initialize");
                self.set_state(name, McpState::Error(e.to_string())).await;
            }
            Err(_) => {
                let e = McpError::Timeout(cfg.timeout_secs);
                warn!(server = name, error = %e, "MCP server initialization timed out");
                self.set_state(name, McpState::Error(e.to_string())).await;
            }
        }
    }

    /// Create a transport, run the handshake, and enumerate tools.
    async fn connect(&self, name: &str, cfg: &McpServerConfig) -> Result<ClientEntry, McpError> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<String>();
        let transport: Arc<dyn Transport> = match cfg.transport {
            McpTransportKind::Stdio => Arc::new(StdioTransport::spawn(cfg, notify_tx)?),
            McpTransportKind::Http => {
                let url = cfg.url.clone().ok_or_else(|| {
                    McpError::Transport("http transport requires url".into())
                })?;
                Arc::new(HttpTransport::new(url, cfg.headers.clone()))
            }
            McpTransportKind::Sse => {
                let url = cfg.url.clone().ok_or_else(|| {
                    McpError::Transport("sse transport requires url".into())
                })?;
                Arc::new(SseTransport::connect(&url, cfg.headers.clone(), notify_tx).await?)
            }
        };

        transport
            .request("initialize", Some(initialize_params()))
            .await?;
        transport.notify("notifications/initialized").await?;
        let tools_value = transport.request("tools/list", None).await?;
        let tools = serde_json::from_value::<ToolsListResult>(tools_value)
            .map_err(|e| McpError::Protocol(format!("tools/list: {e}")))?
            .tools;

        self.spawn_notification_pump(name.to_string(), notify_rx);
        Ok(ClientEntry { transport, tools })
    }

    fn spawn_notification_pump(&self, name: String, mut rx: mpsc::UnboundedReceiver<String>) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(method) = rx.recv().await {
                debug!(server = %name, method = %method, "MCP notification");
                if method == NOTIFICATION_TOOLS_CHANGED {
                    match weak.upgrade() {
                        Some(manager) => manager.refresh_tools(&name).await,
                        None => break,
                    }
                }
            }
        });
    }

    /// Re-enumerate one server's tools and publish the change.
    pub async fn refresh_tools(&self, name: &str) {
        let entry = self.clients.read().await.get(name).cloned();
        let entry = match entry {
            Some(e) => e,
            None => return,
        };
        match entry.transport.request("tools/list", None).await {
            Ok(value) => match serde_json::from_value::<ToolsListResult>(value) {
                Ok(result) => {
                    let replacement = Arc::new(ClientEntry {
                        transport: Arc::clone(&entry.transport),
                        tools: result.tools,
                    });
                    self.clients
                        .write()
                        .await
                        .insert(name.to_string(), replacement);
                    let _ = self.events.send(McpEvent::ToolsListChanged {
                        name: name.to_string(),
                    });
                }
                Err(e) => warn!(server = name, error = %e, "bad tools/list result"),
            },
            Err(e) => warn!(server = name, error = %e, "tools/list refresh failed"),
        }
    }

    async fn set_state(&self, name: &str, state: McpState) {
        self.states
            .write()
            .await
            .insert(name.to_string(), state.clone());
        let _ = self.events.send(McpEvent::StateChanged {
            name: name.to_string(),
            state,
        });
    }

    pub async fn state(&self, name: &str) -> McpState {
        self.states
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or(McpState::Disabled)
    }

    /// All tools of all connected servers as `(server, tool)` pairs.
    pub async fn tools(&self) -> Vec<(String, McpToolDef)> {
        let clients = self.clients.read().await;
        let mut out = Vec::new();
        for (name, entry) in clients.iter() {
            for tool in &entry.tools {
                out.push((name.clone(), tool.clone()));
            }
        }
        out.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        out
    }

    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.events.subscribe()
    }

    /// Call one tool, renewing the connection once if the ping fails.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let entry = self
            .clients
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer(server.to_string()))?;

        let entry = match entry.transport.request("ping", None).await {
            Ok(_) => entry,
            Err(e) => {
                warn!(server, error = %e, "MCP ping failed; renewing client");
                self.set_state(server, McpState::Error(e.to_string())).await;
                entry.transport.close().await;
                self.clients.write().await.remove(server);

                let cfg = self
                    .configs
                    .get(server)
                    .ok_or_else(|| McpError::UnknownServer(server.to_string()))?;
                self.set_state(server, McpState::Starting).await;
                match self.connect(server, cfg).await {
                    Ok(renewed) => {
                        let renewed = Arc::new(renewed);
                        self.clients
                            .write()
                            .await
                            .insert(server.to_string(), Arc::clone(&renewed));
                        self.set_state(server, McpState::Connected).await;
                        renewed
                    }
                    Err(e2) => {
                        self.set_state(server, McpState::Error(e2.to_string())).await;
                        return Err(e2);
                    }
                }
            }
        };

        let result = entry
            .transport
            .request("tools/call", Some(json!({ "name": tool, "arguments": args })))
            .await?;
        serde_json::from_value::<CallToolResult>(result)
            .map_err(|e| McpError::Protocol(format!("tools/call: {e}")))
    }

    /// Close every transport.  Registered as process-shutdown cleanup.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<ClientEntry>> =
            self.clients.write().await.drain().map(|(_, e)| e).collect();
        for entry in clients {
            entry.transport.close().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
