// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Working directory the built-in tools operate in.  Defaults to the
    /// process working directory when empty.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Named provider configurations keyed by the id used in `ModelRef`.
    ///
    /// ```yaml
    /// providers:
    ///   anthropic:
    ///     kind: anthropic
    ///   local:
    ///     kind: openai-compat
    ///     base_url: http://localhost:11434/v1
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub models: ModelSelection,
    /// Per-role agent configuration.  `coder` and `task` get sensible
    /// defaults when absent.
    #[serde(default)]
    pub agents: HashMap<String, AgentRoleConfig>,
    /// MCP servers keyed by name.
    #[serde(default)]
    pub mcp: HashMap<String, McpServerConfig>,
    #[serde(default)]
    pub permissions: PermissionConfig,
}

impl Config {
    /// Resolved config for an agent role, falling back to the built-in
    /// defaults for `coder` / `task` when the role is not in the file.
    pub fn agent(&self, role: &str) -> AgentRoleConfig {
        if let Some(cfg) = self.agents.get(role) {
            return cfg.clone();
        }
        match role {
            "task" => AgentRoleConfig::task_default(),
            _ => AgentRoleConfig::coder_default(),
        }
    }
}

/// Provider wire-format family.  Closed set; everything OpenAI-shaped that
/// is not one of the named gateways uses `openai-compat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    OpenaiCompat,
    Openrouter,
    Google,
    Vertexai,
    Azure,
    Bedrock,
    /// Deterministic in-process driver for tests; no network.
    Mock,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenaiCompat => "openai-compat",
            ProviderKind::Openrouter => "openrouter",
            ProviderKind::Google => "google",
            ProviderKind::Vertexai => "vertexai",
            ProviderKind::Azure => "azure",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Mock => "mock",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Base URL override.  Every hosted provider has a correct default.
    pub base_url: Option<String>,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    pub api_key: Option<String>,
    /// Environment variable holding the API key, read at build time.
    pub api_key_env: Option<String>,
    /// Additional HTTP headers sent on every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON object merged verbatim into every request body
    /// (openai-compatible drivers only).
    #[serde(default)]
    pub extra_body: serde_json::Value,
    /// String parameters consumed by specific drivers, e.g.
    /// `apiVersion` for Azure.
    #[serde(default)]
    pub extra_params: HashMap<String, String>,
    /// Provider-level default options merged under every model's own
    /// option bag (see the option-merge order in `mimir-model`).
    #[serde(default)]
    pub options: serde_json::Value,
    /// Vertex AI project id (`kind: vertexai` only).
    pub project_id: Option<String>,
    /// Vertex AI location (`kind: vertexai` only).
    pub location: Option<String>,
    /// Path override for the model-listing endpoint.  Some
    /// anthropic-compatible gateways serve `/v1/models` instead of the
    /// Anthropic default; set this instead of relying on name matching.
    pub models_path: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Openai,
            base_url: None,
            api_key: None,
            api_key_env: None,
            headers: HashMap::new(),
            extra_body: serde_json::Value::Null,
            extra_params: HashMap::new(),
            options: serde_json::Value::Null,
            project_id: None,
            location: None,
            models_path: None,
        }
    }
}

/// Which of the two configured models an agent role drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    #[default]
    Large,
    Small,
}

/// A provider + model pair with per-model overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    /// Key into `Config.providers`.
    pub provider: String,
    /// Model id forwarded to the provider API.
    pub model: String,
    pub max_tokens: Option<u32>,
    /// Enable extended thinking / reasoning where the provider supports it.
    #[serde(default)]
    pub think: bool,
    /// Reasoning effort hint for OpenAI-style reasoning models
    /// ("low" | "medium" | "high").
    pub reasoning_effort: Option<String>,
    /// Per-model provider option overrides (highest merge priority).
    #[serde(default)]
    pub options: serde_json::Value,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: "claude-sonnet-4-5".into(),
            max_tokens: None,
            think: false,
            reasoning_effort: None,
            options: serde_json::Value::Null,
            temperature: None,
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }
}

/// The two models every agent setup carries: `large` drives conversations
/// and summaries, `small` generates session titles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSelection {
    #[serde(default)]
    pub large: ModelRef,
    #[serde(default)]
    pub small: ModelRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRoleConfig {
    /// Built-in tool names available to this role.  `None` means all.
    pub allowed_tools: Option<Vec<String>>,
    /// MCP servers whose tools this role may use.
    /// Absent → all servers; empty → none; present → listed only.
    pub allowed_mcp: Option<Vec<String>>,
    /// Whether the sub-agent (`agent`) tool is offered to this role.
    #[serde(default = "default_true")]
    pub agent_tool: bool,
    #[serde(default)]
    pub model: ModelRole,
}

impl AgentRoleConfig {
    pub fn coder_default() -> Self {
        Self {
            allowed_tools: None,
            allowed_mcp: None,
            agent_tool: true,
            model: ModelRole::Large,
        }
    }

    /// The task role runs sub-agent sessions: read-only tools, no nesting,
    /// no MCP by default.
    pub fn task_default() -> Self {
        Self {
            allowed_tools: Some(vec![
                "glob".into(),
                "grep".into(),
                "ls".into(),
                "view".into(),
            ]),
            allowed_mcp: Some(vec![]),
            agent_tool: false,
            model: ModelRole::Large,
        }
    }
}

impl Default for AgentRoleConfig {
    fn default() -> Self {
        Self::coder_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Http,
    Sse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub transport: McpTransportKind,
    /// Command to spawn (`transport: stdio`).
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint URL (`transport: http` / `sse`).
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Bound on initialize + tool enumeration at startup.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub disabled: bool,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            transport: McpTransportKind::Stdio,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout_secs(),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Grant every request without evaluation (dangerous; CI use only).
    #[serde(default)]
    pub skip_requests: bool,
    /// Glob patterns (`tool` or `tool:action`) that are always granted.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Glob patterns that are always refused.  Deny wins over allow.
    #[serde(default)]
    pub deny: Vec<String>,
    /// Decision for requests no pattern matches.  An interactive surface
    /// would prompt the user here; the core resolves to this default.
    #[serde(default = "default_true")]
    pub default_allow: bool,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            skip_requests: false,
            allow: Vec::new(),
            deny: Vec::new(),
            default_allow: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
