// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Background session-title generation on the small model.
//!
//! Launched once per session, after the first user message.  Failures are
//! logged and swallowed; a missing title never affects the conversation.

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use mimir_model::{StreamEvent, StreamOptions};
use mimir_session::{Message, Part, Role, Sessions};

use crate::agent::SelectedModel;
use crate::prompts::title_prompt;

const TITLE_MAX_TOKENS: u32 = 40;

pub async fn generate_title(
    model: SelectedModel,
    sessions: Sessions,
    session_id: String,
    prompt: String,
) {
    match run(&model, &prompt).await {
        Ok(title) if !title.is_empty() => {
            if let Err(e) = sessions.set_title(&session_id, title).await {
                warn!(session_id = %session_id, error = %e, "title: save failed");
            }
        }
        Ok(_) => debug!(session_id = %session_id, "title: model returned empty text"),
        Err(e) => warn!(session_id = %session_id, error = %e, "title generation failed"),
    }
}

async fn run(model: &SelectedModel, prompt: &str) -> anyhow::Result<String> {
    let now = Utc::now();
    let user = Message {
        id: Uuid::new_v4().to_string(),
        session_id: String::new(),
        role: Role::User,
        parts: vec![Part::Text {
            text: prompt.to_string(),
        }],
        model: None,
        provider: None,
        cache_hint: false,
        created_at: now,
        updated_at: now,
    };
    let opts = StreamOptions {
        system: title_prompt(),
        messages: vec![user],
        max_output_tokens: Some(TITLE_MAX_TOKENS),
        ..StreamOptions::default()
    };

    let mut stream = model.handle.stream(opts).await?;
    let mut buf = String::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::TextDelta(delta) = event? {
            buf.push_str(&delta);
        }
    }
    Ok(clean_title(&buf))
}

/// Normalize raw model output into a one-line title: drop any leaked
/// `<think>` preamble, fold newlines into spaces, trim.
pub fn clean_title(raw: &str) -> String {
    let after_think = match raw.rfind("</think>") {
        Some(pos) => &raw[pos + "</think>".len()..],
        None => raw,
    };
    after_think
        .replace('\n', " ")
        .trim()
        .trim_matches('"')
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
