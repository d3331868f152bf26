// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/mimir/config.yaml"));
        paths.push(home.join(".config/mimir/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("mimir/config.yaml"));
        paths.push(cfg.join("mimir/config.yml"));
    }

    paths.push(PathBuf::from(".mimir.yaml"));
    paths.push(PathBuf::from(".mimir.yml"));
    paths.push(PathBuf::from("mimir.yaml"));
    paths.push(PathBuf::from("mimir.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config`).
///
/// `${VAR}` / `~` references in the file text are expanded before parsing,
/// so API keys and socket paths can be kept out of the file itself.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(p)?);
    }

    if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        return Ok(Config::default());
    }
    let config: Config =
        serde_yaml::from_value(merged).context("invalid configuration")?;
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let expanded = shellexpand::env(&text)
        .map(|s| s.into_owned())
        .unwrap_or(text);
    serde_yaml::from_str(&expanded).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("models:\n  large:\n    provider: openai\n    model: gpt-4o");
        let src = val("models:\n  large:\n    model: gpt-4o-mini");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["models"]["large"]["provider"].as_str(), Some("openai"));
        assert_eq!(dst["models"]["large"]["model"].as_str(), Some("gpt-4o-mini"));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/mimir_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "models:\n  large:\n    provider: openai\n    model: test-model"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.models.large.provider, "openai");
        assert_eq!(cfg.models.large.model, "test-model");
    }

    #[test]
    fn load_expands_env_vars_in_values() {
        use std::io::Write;
        std::env::set_var("MIMIR_TEST_PROVIDER_XYZ", "anthropic");
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "models:\n  large:\n    provider: ${{MIMIR_TEST_PROVIDER_XYZ}}\n    model: m"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.models.large.provider, "anthropic");
    }
}
