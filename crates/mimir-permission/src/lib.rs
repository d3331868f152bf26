// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Permission gating for tool execution.
//!
//! Decisions are made from configured glob patterns: deny patterns win,
//! then allow patterns, then the global skip flag, then per-session
//! auto-approval (used for sub-agent task sessions), then the configured
//! default.  An interactive surface would prompt the user where the
//! default applies; the core resolves to configuration.

use std::collections::HashSet;
use std::sync::RwLock;

use regex::Regex;
use tracing::debug;

use mimir_config::PermissionConfig;

/// Sentinel error recognized by the agent loop's failure handling:
/// a denied tool call ends the turn with `FinishReason::PermissionDenied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("permission denied")]
pub struct PermissionDenied;

/// One permission question.  `action` is a short verb ("execute",
/// "fetch"); `params` carries the raw tool input for display.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: String,
    pub path: String,
    pub description: String,
    pub params: serde_json::Value,
}

pub struct PermissionService {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    skip: bool,
    default_allow: bool,
    auto_sessions: RwLock<HashSet<String>>,
}

impl PermissionService {
    pub fn from_config(cfg: &PermissionConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            allow: compile(&cfg.allow),
            deny: compile(&cfg.deny),
            skip: cfg.skip_requests,
            default_allow: cfg.default_allow,
            auto_sessions: RwLock::new(HashSet::new()),
        }
    }

    /// Evaluate one request.  Pattern subjects are `tool_name` and
    /// `tool_name:action`, so a config can target a whole tool or one verb.
    pub fn request(&self, req: &PermissionRequest) -> bool {
        let subjects = [
            req.tool_name.clone(),
            format!("{}:{}", req.tool_name, req.action),
        ];
        for re in &self.deny {
            if subjects.iter().any(|s| re.is_match(s)) {
                debug!(
                    tool = %req.tool_name,
                    action = %req.action,
                    session_id = %req.session_id,
                    "permission denied by pattern"
                );
                return false;
            }
        }
        for re in &self.allow {
            if subjects.iter().any(|s| re.is_match(s)) {
                return true;
            }
        }
        if self.skip {
            return true;
        }
        if self
            .auto_sessions
            .read()
            .map(|set| set.contains(&req.session_id))
            .unwrap_or(false)
        {
            return true;
        }
        self.default_allow
    }

    /// Grant everything for one session.  Used for sub-agent task sessions
    /// so nested loops never stall on a prompt nobody can answer.
    pub fn auto_approve_session(&self, session_id: &str) {
        if let Ok(mut set) = self.auto_sessions.write() {
            set.insert(session_id.to_string());
        }
    }

    pub fn skip_requests(&self) -> bool {
        self.skip
    }
}

/// Convert a simple shell glob to an anchored [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
