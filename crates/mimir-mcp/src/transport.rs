// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP transports: stdio subprocess, streamable HTTP, and legacy SSE.
//!
//! All three present the same [`Transport`] surface: correlated
//! request/response by JSON-RPC id, fire-and-forget notifications, and a
//! liveness probe the manager uses before every tool call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use mimir_config::McpServerConfig;

use crate::protocol::{RpcNotification, RpcRequest, RpcResponse};

/// Upper bound on a single in-flight request; connection-level timeouts
/// (initialize, enumerate) are enforced by the manager.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("mcp transport error: {0}")]
    Transport(String),
    #[error("mcp protocol error: {0}")]
    Protocol(String),
    #[error("mcp server not configured: {0}")]
    UnknownServer(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;
    async fn notify(&self, method: &str) -> Result<(), McpError>;
    fn is_alive(&self) -> bool;
    async fn close(&self);
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

fn response_to_result(resp: RpcResponse) -> Result<Value, McpError> {
    if let Some(err) = resp.error {
        return Err(McpError::Protocol(err.to_string()));
    }
    Ok(resp.result.unwrap_or(Value::Null))
}

/// Route one decoded JSON value: responses resolve their pending waiter,
/// notifications are forwarded to the manager by method name.
fn route_incoming(v: Value, pending: &PendingMap, notify_tx: &mpsc::UnboundedSender<String>) {
    let has_id = v.get("id").map(|id| !id.is_null()).unwrap_or(false);
    let has_method = v.get("method").is_some();
    if has_id && !has_method {
        match serde_json::from_value::<RpcResponse>(v) {
            Ok(resp) => {
                if let Some(id) = resp.id {
                    let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
                    if let Some(tx) = waiter {
                        let _ = tx.send(resp);
                    }
                }
            }
            Err(e) => warn!(error = %e, "unparseable MCP response"),
        }
    } else if has_method && !has_id {
        if let Some(method) = v["method"].as_str() {
            let _ = notify_tx.send(method.to_string());
        }
    } else {
        // Server-initiated request (sampling, roots); not supported.
        debug!("ignoring server-initiated MCP request");
    }
}

// ─── stdio ────────────────────────────────────────────────────────────────────

/// Child-process transport: newline-delimited JSON-RPC over stdio.
pub struct StdioTransport {
    stdin: tokio::sync::Mutex<tokio::process::ChildStdin>,
    child: tokio::sync::Mutex<tokio::process::Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl StdioTransport {
    pub fn spawn(
        cfg: &McpServerConfig,
        notify_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Self, McpError> {
        if cfg.command.is_empty() {
            return Err(McpError::Transport(
                "stdio transport requires a command".into(),
            ));
        }
        let mut child = tokio::process::Command::new(&cfg.command)
            .args(&cfg.args)
            .envs(&cfg.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Transport(format!("spawn {}: {e}", cfg.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(16 * 1024 * 1024));
                while let Some(line) = lines.next().await {
                    let line = match line {
                        Ok(l) => l,
                        Err(e) => {
                            warn!(error = %e, "mcp stdio read error");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(v) => route_incoming(v, &pending, &notify_tx),
                        Err(e) => warn!(error = %e, "non-JSON line from MCP server"),
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // Drop all waiters so in-flight requests fail promptly.
                if let Ok(mut p) = pending.lock() {
                    p.clear();
                }
            })
        };

        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader,
        })
    }

    async fn write_line(&self, line: String) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("write: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| McpError::Transport(format!("write: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("flush: {e}")))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if !self.is_alive() {
            return Err(McpError::Transport("server process exited".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(id, tx);
        }
        let line = serde_json::to_string(&RpcRequest::new(id, method, params))
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        self.write_line(line).await?;

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => response_to_result(resp),
            Ok(Err(_)) => Err(McpError::Transport("connection closed".into())),
            Err(_) => {
                if let Ok(mut p) = self.pending.lock() {
                    p.remove(&id);
                }
                Err(McpError::Transport(format!("{method} request timed out")))
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let line = serde_json::to_string(&RpcNotification::new(method))
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        self.write_line(line).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.reader.abort();
        let _ = self.child.lock().await.kill().await;
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

/// Streamable-HTTP transport: one POST per request.  The server may reply
/// with plain JSON or a short event stream carrying the response.
pub struct HttpTransport {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        let mut headers: Vec<(String, String)> = headers.into_iter().collect();
        headers.sort();
        Self {
            url,
            headers,
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response, McpError> {
        let mut rb = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        for (name, value) in &self.headers {
            rb = rb.header(name.as_str(), value.as_str());
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!("HTTP {}", resp.status())));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let resp = self.post(&RpcRequest::new(id, method, params)).await?;

        let is_sse = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);
        let text = resp
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let parsed: RpcResponse = if is_sse {
            text.lines()
                .filter_map(|l| l.strip_prefix("data:"))
                .filter_map(|d| serde_json::from_str::<RpcResponse>(d.trim()).ok())
                .find(|r| r.id == Some(id))
                .ok_or_else(|| {
                    McpError::Protocol("no matching response in event stream".into())
                })?
        } else {
            serde_json::from_str(&text).map_err(|e| McpError::Protocol(e.to_string()))?
        };
        response_to_result(parsed)
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        self.post(&RpcNotification::new(method)).await.map(|_| ())
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

// ─── SSE ──────────────────────────────────────────────────────────────────────

/// Legacy HTTP+SSE transport: a long-lived GET stream delivers responses
/// and notifications; requests are POSTed to the endpoint the server
/// announces in its first `endpoint` event.
pub struct SseTransport {
    endpoint: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl SseTransport {
    pub async fn connect(
        url: &str,
        headers: HashMap<String, String>,
        notify_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Self, McpError> {
        let mut sorted_headers: Vec<(String, String)> = headers.into_iter().collect();
        sorted_headers.sort();
        let client = reqwest::Client::new();

        let mut rb = client.get(url).header("Accept", "text/event-stream");
        for (name, value) in &sorted_headers {
            rb = rb.header(name.as_str(), value.as_str());
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!("HTTP {}", resp.status())));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let base = url.to_string();

        let reader = {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                let mut endpoint_tx = Some(endpoint_tx);
                let mut bytes = resp.bytes_stream();
                let mut buf = String::new();
                let mut event_name = String::new();
                while let Some(chunk) = bytes.next().await {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(error = %e, "mcp sse read error");
                            break;
                        }
                    };
                    buf.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(pos) = buf.find('\n') {
                        let line = buf[..pos].trim_end_matches('\r').to_string();
                        buf.drain(..=pos);
                        if let Some(name) = line.strip_prefix("event:") {
                            event_name = name.trim().to_string();
                        } else if let Some(data) = line.strip_prefix("data:") {
                            let data = data.trim();
                            if event_name == "endpoint" {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(resolve_endpoint(&base, data));
                                }
                            } else if let Ok(v) = serde_json::from_str::<Value>(data) {
                                route_incoming(v, &pending, &notify_tx);
                            }
                        } else if line.is_empty() {
                            event_name.clear();
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                if let Ok(mut p) = pending.lock() {
                    p.clear();
                }
            })
        };

        let endpoint = endpoint_rx
            .await
            .map_err(|_| McpError::Transport("SSE stream closed before endpoint event".into()))?;

        Ok(Self {
            endpoint,
            headers: sorted_headers,
            client,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader,
        })
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<(), McpError> {
        let mut rb = self.client.post(&self.endpoint).json(body);
        for (name, value) in &self.headers {
            rb = rb.header(name.as_str(), value.as_str());
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if !self.is_alive() {
            return Err(McpError::Transport("SSE stream closed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(id, tx);
        }
        self.post(&RpcRequest::new(id, method, params)).await?;

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => response_to_result(resp),
            Ok(Err(_)) => Err(McpError::Transport("connection closed".into())),
            Err(_) => {
                if let Ok(mut p) = self.pending.lock() {
                    p.remove(&id);
                }
                Err(McpError::Transport(format!("{method} request timed out")))
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        self.post(&RpcNotification::new(method)).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.reader.abort();
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Resolve the endpoint the server announced against the SSE base URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    // Relative path: keep scheme + authority from the base URL.
    let origin = match base.find("://") {
        Some(scheme_end) => match base[scheme_end + 3..].find('/') {
            Some(path_start) => &base[..scheme_end + 3 + path_start],
            None => base,
        },
        None => base,
    };
    format!("{}/{}", origin.trim_end_matches('/'), endpoint.trim_start_matches('/'))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_channel() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn resolve_endpoint_absolute_passthrough() {
        assert_eq!(
            resolve_endpoint("https://host/sse", "https://other/messages"),
            "https://other/messages"
        );
    }

    #[test]
    fn resolve_endpoint_relative_keeps_origin() {
        assert_eq!(
            resolve_endpoint("https://host:8080/sse/stream", "/messages?id=1"),
            "https://host:8080/messages?id=1"
        );
    }

    #[test]
    fn route_incoming_resolves_pending_waiter() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = notify_channel();
        let (otx, mut orx) = oneshot::channel();
        pending.lock().unwrap().insert(3, otx);
        route_incoming(
            serde_json::json!({"jsonrpc":"2.0","id":3,"result":{"ok":true}}),
            &pending,
            &tx,
        );
        let resp = orx.try_recv().unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn route_incoming_forwards_notifications() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = notify_channel();
        route_incoming(
            serde_json::json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"}),
            &pending,
            &tx,
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            "notifications/tools/list_changed"
        );
    }

    #[test]
    fn spawn_fails_without_command() {
        let (tx, _rx) = notify_channel();
        let cfg = McpServerConfig::default();
        let err = StdioTransport::spawn(&cfg, tx);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn stdio_round_trip_with_cat_like_server() {
        // A tiny shell MCP "server" that answers the first request line
        // with a canned JSON-RPC response on stdout.
        let (tx, _rx) = notify_channel();
        let cfg = McpServerConfig {
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"pong":true}}\n'"#.into(),
            ],
            ..McpServerConfig::default()
        };
        let transport = StdioTransport::spawn(&cfg, tx).unwrap();
        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result["pong"], true);
        transport.close().await;
        assert!(!transport.is_alive());
    }

    #[test]
    fn timeout_error_message_names_seconds() {
        let e = McpError::Timeout(15);
        assert_eq!(e.to_string(), "timed out after 15s");
    }
}
