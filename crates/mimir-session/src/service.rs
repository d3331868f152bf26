// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process `Sessions` / `Messages` services.
//!
//! Both services serialize their own writes behind an `RwLock` and publish
//! change events on a broadcast broker; late subscribers see only new
//! events.  The surface layer streams the conversation by subscribing to
//! `Messages` rather than by holding a channel into the agent loop.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::types::{Message, Part, Role, Session};

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session: Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEventKind {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub kind: MessageEventKind,
    pub message: Message,
}

/// Session store.  Clone is cheap; all clones share state.
#[derive(Clone)]
pub struct Sessions {
    inner: Arc<RwLock<HashMap<String, Session>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for Sessions {
    fn default() -> Self {
        Self::new()
    }
}

impl Sessions {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub async fn create(&self, title: impl Into<String>) -> Session {
        self.insert(Uuid::new_v4().to_string(), None, title.into())
            .await
    }

    /// Create a child session with a caller-supplied deterministic id.
    /// Creating the same id twice returns the existing session unchanged,
    /// which makes sub-agent invocations idempotent under retry.
    pub async fn create_task_session(
        &self,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Session {
        let id = id.into();
        if let Some(existing) = self.inner.read().await.get(&id) {
            return existing.clone();
        }
        self.insert(id, Some(parent_id.into()), title.into()).await
    }

    async fn insert(&self, id: String, parent: Option<String>, title: String) -> Session {
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            parent_session_id: parent,
            title,
            cost: 0.0,
            prompt_tokens: 0,
            completion_tokens: 0,
            summary_message_id: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.write().await.insert(id, session.clone());
        let _ = self.events.send(SessionEvent {
            session: session.clone(),
        });
        session
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Session> {
        self.inner
            .read()
            .await
            .get(id)
            .cloned()
            .with_context(|| format!("session not found: {id}"))
    }

    /// Persist a session.  Cost is clamped so observers never see it
    /// decrease between successive reads.
    pub async fn save(&self, mut session: Session) -> anyhow::Result<Session> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .get(&session.id)
            .with_context(|| format!("session not found: {}", session.id))?;
        if session.cost < existing.cost {
            debug!(
                session_id = %session.id,
                incoming = session.cost,
                existing = existing.cost,
                "ignoring cost decrease on save"
            );
            session.cost = existing.cost;
        }
        session.updated_at = Utc::now();
        inner.insert(session.id.clone(), session.clone());
        let _ = self.events.send(SessionEvent {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Update only the title.  Used by the background title generator so
    /// a stale snapshot cannot stomp token counters written concurrently
    /// by the agent loop.
    pub async fn set_title(&self, id: &str, title: impl Into<String>) -> anyhow::Result<Session> {
        let mut inner = self.inner.write().await;
        let session = inner
            .get_mut(id)
            .with_context(|| format!("session not found: {id}"))?;
        session.title = title.into();
        session.updated_at = Utc::now();
        let updated = session.clone();
        drop(inner);
        let _ = self.events.send(SessionEvent {
            session: updated.clone(),
        });
        Ok(updated)
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.inner.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Deterministic child-session id for a sub-agent invocation.
    ///
    /// Hashes `parent_message_id || tool_call_id`, so two identical
    /// concurrent invocations resolve to the same session.
    pub fn agent_tool_session_id(parent_message_id: &str, tool_call_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parent_message_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(tool_call_id.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}

/// Message store.  Messages are ordered by creation within a session;
/// appends and in-place updates publish to the broker.
#[derive(Clone)]
pub struct Messages {
    inner: Arc<RwLock<HashMap<String, Vec<Message>>>>,
    events: broadcast::Sender<MessageEvent>,
}

impl Default for Messages {
    fn default() -> Self {
        Self::new()
    }
}

impl Messages {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub async fn create(
        &self,
        session_id: &str,
        role: Role,
        parts: Vec<Part>,
        model: Option<String>,
        provider: Option<String>,
    ) -> Message {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            parts,
            model,
            provider,
            cache_hint: false,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        let _ = self.events.send(MessageEvent {
            kind: MessageEventKind::Created,
            message: message.clone(),
        });
        message
    }

    /// Replace the stored message with the same id.
    pub async fn update(&self, mut message: Message) -> anyhow::Result<Message> {
        message.updated_at = Utc::now();
        let mut inner = self.inner.write().await;
        let list = inner
            .get_mut(&message.session_id)
            .with_context(|| format!("no messages for session {}", message.session_id))?;
        let slot = list.iter_mut().find(|m| m.id == message.id);
        match slot {
            Some(m) => *m = message.clone(),
            None => bail!(
                "message {} not found in session {}",
                message.id,
                message.session_id
            ),
        }
        let _ = self.events.send(MessageEvent {
            kind: MessageEventKind::Updated,
            message: message.clone(),
        });
        Ok(message)
    }

    pub async fn list(&self, session_id: &str) -> Vec<Message> {
        self.inner
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get(&self, session_id: &str, message_id: &str) -> anyhow::Result<Message> {
        self.inner
            .read()
            .await
            .get(session_id)
            .and_then(|list| list.iter().find(|m| m.id == message_id))
            .cloned()
            .with_context(|| format!("message not found: {message_id}"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FinishReason;

    #[tokio::test]
    async fn create_and_get_session() {
        let sessions = Sessions::new();
        let s = sessions.create("hello").await;
        let loaded = sessions.get(&s.id).await.unwrap();
        assert_eq!(loaded.title, "hello");
        assert_eq!(loaded.cost, 0.0);
    }

    #[tokio::test]
    async fn get_unknown_session_is_error() {
        let sessions = Sessions::new();
        assert!(sessions.get("nope").await.is_err());
    }

    #[tokio::test]
    async fn save_clamps_cost_decrease() {
        let sessions = Sessions::new();
        let mut s = sessions.create("t").await;
        s.cost = 0.5;
        sessions.save(s.clone()).await.unwrap();
        s.cost = 0.1;
        let saved = sessions.save(s).await.unwrap();
        assert_eq!(saved.cost, 0.5, "cost must never decrease");
    }

    #[tokio::test]
    async fn set_title_touches_only_the_title() {
        let sessions = Sessions::new();
        let mut s = sessions.create("old").await;
        s.cost = 1.5;
        s.prompt_tokens = 42;
        sessions.save(s).await.unwrap();
        let updated = sessions.set_title(&sessions.list().await[0].id, "new").await.unwrap();
        assert_eq!(updated.title, "new");
        assert_eq!(updated.cost, 1.5);
        assert_eq!(updated.prompt_tokens, 42);
    }

    #[tokio::test]
    async fn task_session_is_idempotent_by_id() {
        let sessions = Sessions::new();
        let parent = sessions.create("parent").await;
        let id = Sessions::agent_tool_session_id("msg-1", "call-1");
        let a = sessions
            .create_task_session(&id, &parent.id, "child")
            .await;
        let b = sessions
            .create_task_session(&id, &parent.id, "child")
            .await;
        assert_eq!(a.id, b.id);
        assert_eq!(a.created_at, b.created_at, "second create must be a no-op");
        assert_eq!(a.parent_session_id.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn agent_tool_session_id_is_deterministic() {
        let a = Sessions::agent_tool_session_id("msg-1", "call-1");
        let b = Sessions::agent_tool_session_id("msg-1", "call-1");
        let c = Sessions::agent_tool_session_id("msg-1", "call-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn messages_are_ordered_by_creation() {
        let messages = Messages::new();
        let m1 = messages
            .create("s", Role::User, vec![], None, None)
            .await;
        let m2 = messages
            .create("s", Role::Assistant, vec![], None, None)
            .await;
        let list = messages.list("s").await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, m1.id);
        assert_eq!(list[1].id, m2.id);
    }

    #[tokio::test]
    async fn update_replaces_in_place() {
        let messages = Messages::new();
        let mut m = messages
            .create("s", Role::Assistant, vec![], None, None)
            .await;
        m.append_text("streamed");
        m.set_finish(FinishReason::EndTurn, String::new(), String::new());
        messages.update(m.clone()).await.unwrap();
        let list = messages.list("s").await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].text(), "streamed");
        assert_eq!(list[0].finish_reason(), Some(FinishReason::EndTurn));
    }

    #[tokio::test]
    async fn update_unknown_message_is_error() {
        let messages = Messages::new();
        let m = messages
            .create("s", Role::User, vec![], None, None)
            .await;
        let mut phantom = m.clone();
        phantom.id = "other-id".into();
        assert!(messages.update(phantom).await.is_err());
    }

    #[tokio::test]
    async fn subscribe_sees_created_and_updated() {
        let messages = Messages::new();
        let mut rx = messages.subscribe();
        let m = messages
            .create("s", Role::User, vec![], None, None)
            .await;
        messages.update(m).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, MessageEventKind::Created);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, MessageEventKind::Updated);
    }
}
