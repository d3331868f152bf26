// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider-option resolution.
//!
//! Three JSON bags are merged in order of increasing priority: catalog
//! model defaults → provider-config defaults → per-model override.  The
//! merge is a deep object merge, last-writer-wins at leaves.  Sampling
//! knobs are resolved separately with a "first non-nil" rule because a
//! scalar `None` must not shadow a configured catalog default.

use serde_json::{json, Map, Value};

use mimir_config::{ModelRef, ProviderKind};

use crate::catalog::ModelCatalogEntry;

/// Deep-merge `overlay` into `base`; overlay wins at leaves.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                deep_merge(b.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay.clone();
            }
        }
    }
}

/// Merge the three option layers and apply provider-specific
/// post-processing.  Returns an object (possibly empty).
pub fn resolve_provider_options(
    kind: ProviderKind,
    entry: Option<&ModelCatalogEntry>,
    provider_defaults: &Value,
    model: &ModelRef,
) -> Value {
    let mut merged = Value::Object(Map::new());
    if let Some(e) = entry {
        deep_merge(&mut merged, &e.default_options);
    }
    deep_merge(&mut merged, provider_defaults);
    deep_merge(&mut merged, &model.options);

    finalize(kind, entry, model, &mut merged);
    merged
}

/// Provider-specific defaults injected after the merge, mirroring what the
/// hosted SDKs do for their own option bags.
fn finalize(
    kind: ProviderKind,
    entry: Option<&ModelCatalogEntry>,
    model: &ModelRef,
    opts: &mut Value,
) {
    let map = match opts.as_object_mut() {
        Some(m) => m,
        None => return,
    };
    match kind {
        ProviderKind::Openai | ProviderKind::Azure => {
            if !map.contains_key("reasoning_effort") {
                if let Some(effort) = &model.reasoning_effort {
                    map.insert("reasoning_effort".into(), json!(effort));
                }
            }
            let reasons = entry.map(|e| e.can_reason).unwrap_or(false);
            if reasons {
                map.entry("reasoning_summary".to_string())
                    .or_insert(json!("auto"));
                map.entry("include".to_string())
                    .or_insert(json!(["reasoning.encrypted_content"]));
            }
        }
        ProviderKind::Anthropic => {
            if !map.contains_key("thinking") && model.think {
                map.insert("thinking".into(), json!({ "budget_tokens": 2000 }));
            }
        }
        ProviderKind::Openrouter => {
            if !map.contains_key("reasoning") {
                if let Some(effort) = &model.reasoning_effort {
                    map.insert(
                        "reasoning".into(),
                        json!({ "enabled": true, "effort": effort }),
                    );
                }
            }
        }
        ProviderKind::Google | ProviderKind::Vertexai => {
            if !map.contains_key("thinking_config") {
                map.insert(
                    "thinking_config".into(),
                    json!({ "thinking_budget": 2000, "include_thoughts": true }),
                );
            }
        }
        _ => {}
    }
}

/// Resolved sampling knobs: the model override wins, the catalog default
/// fills the gaps, everything else stays `None` (provider default).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolvedSampling {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

pub fn resolve_sampling(
    model: &ModelRef,
    entry: Option<&ModelCatalogEntry>,
) -> ResolvedSampling {
    let defaults = entry.map(|e| e.sampling).unwrap_or_default();
    ResolvedSampling {
        temperature: model.temperature.or(defaults.temperature),
        top_p: model.top_p.or(defaults.top_p),
        top_k: model.top_k.or(defaults.top_k),
        frequency_penalty: model.frequency_penalty.or(defaults.frequency_penalty),
        presence_penalty: model.presence_penalty.or(defaults.presence_penalty),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
