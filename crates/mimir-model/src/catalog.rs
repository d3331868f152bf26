// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static model catalog: context windows, output limits, per-token cost
//! rates, and modality flags for the models mimir ships knowledge of.
//!
//! The catalog is the lowest-priority layer of the provider-option merge
//! and the source of the per-1M-token rates used for session cost
//! accounting.  Models absent from the catalog still work; they simply
//! bill at zero and fall back to conservative defaults.

use serde_json::json;

/// Sampling defaults a catalog entry may carry.  Used in the
/// "first non-nil" resolution against per-model overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingDefaults {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelCatalogEntry {
    /// Model id as sent to the provider API.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Provider id this entry belongs to.
    pub provider: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// Dollar cost per one million tokens, by billing category.
    pub cost_per_1m_input: f64,
    pub cost_per_1m_output: f64,
    pub cost_per_1m_cache_read: f64,
    pub cost_per_1m_cache_write: f64,
    pub supports_images: bool,
    /// Model exposes a reasoning / extended-thinking surface.
    pub can_reason: bool,
    /// Default provider options (lowest merge priority).
    pub default_options: serde_json::Value,
    pub sampling: SamplingDefaults,
}

impl ModelCatalogEntry {
    fn new(provider: &str, id: &str, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.into(),
            context_window: 128_000,
            max_output_tokens: 8_192,
            cost_per_1m_input: 0.0,
            cost_per_1m_output: 0.0,
            cost_per_1m_cache_read: 0.0,
            cost_per_1m_cache_write: 0.0,
            supports_images: false,
            can_reason: false,
            default_options: serde_json::Value::Null,
            sampling: SamplingDefaults::default(),
        }
    }

    /// Convert one step's usage into dollars using this entry's rates.
    pub fn step_cost(&self, usage: &crate::Usage) -> f64 {
        (usage.input_tokens as f64 / 1e6) * self.cost_per_1m_input
            + (usage.output_tokens as f64 / 1e6) * self.cost_per_1m_output
            + (usage.cache_read_tokens as f64 / 1e6) * self.cost_per_1m_cache_read
            + (usage.cache_creation_tokens as f64 / 1e6) * self.cost_per_1m_cache_write
    }
}

/// All catalog entries.  Rebuilt per call; entries are small.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    vec![
        // ── Anthropic ─────────────────────────────────────────────────────────
        ModelCatalogEntry {
            context_window: 200_000,
            max_output_tokens: 64_000,
            cost_per_1m_input: 3.0,
            cost_per_1m_output: 15.0,
            cost_per_1m_cache_read: 0.3,
            cost_per_1m_cache_write: 3.75,
            supports_images: true,
            can_reason: true,
            ..ModelCatalogEntry::new("anthropic", "claude-sonnet-4-5", "Claude Sonnet 4.5")
        },
        ModelCatalogEntry {
            context_window: 200_000,
            max_output_tokens: 32_000,
            cost_per_1m_input: 15.0,
            cost_per_1m_output: 75.0,
            cost_per_1m_cache_read: 1.5,
            cost_per_1m_cache_write: 18.75,
            supports_images: true,
            can_reason: true,
            ..ModelCatalogEntry::new("anthropic", "claude-opus-4-5", "Claude Opus 4.5")
        },
        ModelCatalogEntry {
            context_window: 200_000,
            max_output_tokens: 8_192,
            cost_per_1m_input: 0.8,
            cost_per_1m_output: 4.0,
            cost_per_1m_cache_read: 0.08,
            cost_per_1m_cache_write: 1.0,
            supports_images: true,
            ..ModelCatalogEntry::new("anthropic", "claude-haiku-4-5", "Claude Haiku 4.5")
        },
        // ── OpenAI ────────────────────────────────────────────────────────────
        ModelCatalogEntry {
            cost_per_1m_input: 2.5,
            cost_per_1m_output: 10.0,
            cost_per_1m_cache_read: 1.25,
            supports_images: true,
            ..ModelCatalogEntry::new("openai", "gpt-4o", "GPT-4o")
        },
        ModelCatalogEntry {
            context_window: 400_000,
            max_output_tokens: 128_000,
            cost_per_1m_input: 1.25,
            cost_per_1m_output: 10.0,
            cost_per_1m_cache_read: 0.125,
            supports_images: true,
            can_reason: true,
            default_options: json!({ "reasoning_effort": "medium" }),
            ..ModelCatalogEntry::new("openai", "gpt-5", "GPT-5")
        },
        ModelCatalogEntry {
            context_window: 200_000,
            max_output_tokens: 100_000,
            cost_per_1m_input: 2.0,
            cost_per_1m_output: 8.0,
            cost_per_1m_cache_read: 0.5,
            can_reason: true,
            ..ModelCatalogEntry::new("openai", "o3", "OpenAI o3")
        },
        // ── Google ────────────────────────────────────────────────────────────
        ModelCatalogEntry {
            context_window: 1_048_576,
            max_output_tokens: 65_536,
            cost_per_1m_input: 1.25,
            cost_per_1m_output: 10.0,
            cost_per_1m_cache_read: 0.31,
            supports_images: true,
            can_reason: true,
            ..ModelCatalogEntry::new("google", "gemini-2.5-pro", "Gemini 2.5 Pro")
        },
        ModelCatalogEntry {
            context_window: 1_048_576,
            max_output_tokens: 65_536,
            cost_per_1m_input: 0.3,
            cost_per_1m_output: 2.5,
            cost_per_1m_cache_read: 0.075,
            supports_images: true,
            ..ModelCatalogEntry::new("google", "gemini-2.5-flash", "Gemini 2.5 Flash")
        },
        // ── OpenRouter ────────────────────────────────────────────────────────
        ModelCatalogEntry {
            context_window: 262_144,
            max_output_tokens: 32_768,
            cost_per_1m_input: 0.6,
            cost_per_1m_output: 2.5,
            ..ModelCatalogEntry::new(
                "openrouter",
                "moonshotai/kimi-k2-0905",
                "Kimi K2 0905",
            )
        },
        ModelCatalogEntry {
            context_window: 163_840,
            max_output_tokens: 65_536,
            cost_per_1m_input: 0.27,
            cost_per_1m_output: 1.0,
            can_reason: true,
            ..ModelCatalogEntry::new(
                "openrouter",
                "deepseek/deepseek-v3.1-terminus",
                "DeepSeek V3.1 Terminus",
            )
        },
        // ── Bedrock ───────────────────────────────────────────────────────────
        ModelCatalogEntry {
            context_window: 200_000,
            max_output_tokens: 64_000,
            cost_per_1m_input: 3.0,
            cost_per_1m_output: 15.0,
            supports_images: true,
            can_reason: true,
            ..ModelCatalogEntry::new(
                "bedrock",
                "us.anthropic.claude-sonnet-4-5-20250929-v1:0",
                "Claude Sonnet 4.5 (Bedrock)",
            )
        },
    ]
}

/// Look up an entry by provider id + model id.  The `:exacto` OpenRouter
/// suffix is ignored for the lookup so variant models keep their metadata.
pub fn lookup(provider: &str, model: &str) -> Option<ModelCatalogEntry> {
    let model = model.strip_suffix(":exacto").unwrap_or(model);
    static_catalog()
        .into_iter()
        .find(|e| e.provider == provider && e.id == model)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
