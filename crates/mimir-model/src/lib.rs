// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod options;
mod anthropic;
mod bedrock;
mod google;
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use anthropic::AnthropicModel;
pub use bedrock::BedrockModel;
pub use catalog::ModelCatalogEntry;
pub use google::GoogleModel;
pub use mock::{MockModel, Scripted, ScriptedModel};
pub use openai_compat::{AuthStyle, OpenAiCompatModel};
pub use provider::{EventStream, LanguageModel};
pub use types::{StopReason, StreamEvent, StreamOptions, ToolSchema, Usage};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;

use mimir_config::{ModelRef, ProviderConfig, ProviderKind};

/// Model ids that require the `:exacto` variant suffix on OpenRouter.
const EXACTO_MODELS: &[&str] = &[
    "moonshotai/kimi-k2-0905",
    "deepseek/deepseek-v3.1-terminus",
    "z-ai/glm-4.6",
    "openai/gpt-oss-120b",
    "qwen/qwen3-coder",
];

/// Construct a [`LanguageModel`] for `model` from the named provider table.
///
/// Selects the driver by `ProviderConfig.kind`; each kind carries the
/// type-specific construction behavior (auth header shape, beta headers,
/// URL layout, env fallbacks).  Option-bag merging is a separate concern —
/// see [`options::resolve_provider_options`] — because the Coordinator
/// re-resolves options per call while the driver itself is long-lived.
pub fn build_model(
    providers: &HashMap<String, ProviderConfig>,
    model: &ModelRef,
) -> anyhow::Result<Arc<dyn LanguageModel>> {
    let cfg = providers
        .get(&model.provider)
        .with_context(|| format!("unknown provider: {}", model.provider))?;
    let key = resolve_api_key(cfg);

    match cfg.kind {
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicModel::new(
            model.model.clone(),
            key,
            cfg.base_url.clone(),
            cfg.headers.clone(),
            model.think,
        ))),
        ProviderKind::Openai => Ok(Arc::new(OpenAiCompatModel::new(
            "openai",
            model.model.clone(),
            key,
            cfg.base_url.as_deref().unwrap_or("https://api.openai.com/v1"),
            header_vec(cfg),
            AuthStyle::Bearer,
            cfg.extra_body.clone(),
        ))),
        ProviderKind::OpenaiCompat => {
            let base = cfg
                .base_url
                .as_deref()
                .context("openai-compat provider requires base_url")?;
            Ok(Arc::new(OpenAiCompatModel::new(
                "openai-compat",
                model.model.clone(),
                key,
                base,
                header_vec(cfg),
                AuthStyle::Bearer,
                cfg.extra_body.clone(),
            )))
        }
        ProviderKind::Openrouter => Ok(Arc::new(OpenAiCompatModel::new(
            "openrouter",
            exacto_model_id(&model.model),
            key,
            cfg.base_url.as_deref().unwrap_or("https://openrouter.ai/api/v1"),
            // OpenRouter's optional HTTP-Referer / X-Title attribution
            // headers are supplied via `ProviderConfig.headers` when the
            // installation wants app attribution.
            header_vec(cfg),
            AuthStyle::Bearer,
            cfg.extra_body.clone(),
        ))),
        ProviderKind::Azure => {
            let base = cfg
                .base_url
                .as_deref()
                .context("azure provider requires base_url")?;
            let api_version = cfg
                .extra_params
                .get("apiVersion")
                .context("azure provider requires extra_params.apiVersion")?;
            let chat_url = format!(
                "{}/chat/completions?api-version={}",
                base.trim_end_matches('/'),
                api_version
            );
            Ok(Arc::new(OpenAiCompatModel::with_full_chat_url(
                "azure",
                model.model.clone(),
                key,
                chat_url,
                header_vec(cfg),
                AuthStyle::ApiKeyHeader,
                cfg.extra_body.clone(),
            )))
        }
        ProviderKind::Google => Ok(Arc::new(GoogleModel::gemini(
            model.model.clone(),
            key,
            cfg.base_url.clone(),
        ))),
        ProviderKind::Vertexai => {
            let project = cfg
                .project_id
                .as_deref()
                .context("vertexai provider requires project_id")?;
            let location = cfg
                .location
                .as_deref()
                .context("vertexai provider requires location")?;
            Ok(Arc::new(GoogleModel::vertex(
                model.model.clone(),
                key,
                project,
                location,
            )))
        }
        ProviderKind::Bedrock => {
            let token = std::env::var("AWS_BEARER_TOKEN_BEDROCK").ok().or(key);
            let region = cfg
                .extra_params
                .get("region")
                .cloned()
                .or_else(|| std::env::var("AWS_REGION").ok())
                .unwrap_or_else(|| "us-east-1".into());
            Ok(Arc::new(BedrockModel::new(model.model.clone(), token, region)))
        }
        ProviderKind::Mock => Ok(Arc::new(MockModel)),
    }
}

/// Append the `:exacto` suffix for models in the exacto set, unless the
/// config already names a variant.
fn exacto_model_id(model: &str) -> String {
    if EXACTO_MODELS.contains(&model) {
        format!("{model}:exacto")
    } else {
        model.to_string()
    }
}

fn resolve_api_key(cfg: &ProviderConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    let default_env = match cfg.kind {
        ProviderKind::Openai => Some("OPENAI_API_KEY"),
        ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
        ProviderKind::Openrouter => Some("OPENROUTER_API_KEY"),
        ProviderKind::Google | ProviderKind::Vertexai => Some("GEMINI_API_KEY"),
        ProviderKind::Azure => Some("AZURE_OPENAI_API_KEY"),
        _ => None,
    };
    default_env.and_then(|env| std::env::var(env).ok())
}

fn header_vec(cfg: &ProviderConfig) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = cfg
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.sort();
    headers
}

/// Shared retry classification for HTTP drivers: transient statuses are
/// retried with backoff honoring `Retry-After`; everything else is fatal.
pub(crate) fn retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

pub(crate) fn retry_delay(
    retry_after: Option<&str>,
    attempt: u32,
) -> std::time::Duration {
    if let Some(secs) = retry_after.and_then(|s| s.trim().parse::<u64>().ok()) {
        return std::time::Duration::from_secs(secs.min(60));
    }
    // Exponential backoff: 1s, 2s, 4s, ... capped at 30s.
    std::time::Duration::from_secs((1u64 << attempt.min(5)).min(30))
}

pub(crate) const MAX_STREAM_RETRIES: u32 = 5;

// ─── Unit tests ──────────────────────────────────────────────────────────────
