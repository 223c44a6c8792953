//! Provider configuration: YAML load, `${ENV}` expansion, and model label
//! resolution.
//!
//! ```yaml
//! providers:
//!   - name: ollama
//!     endpoint: http://localhost:11434/v1
//!     models:
//!       fast: qwen3:8b
//!       smart:
//!         model: qwen3:32b
//!         max_tokens: 16384
//!         transform: [schema:ollama, extrathinktag]
//!   - name: openrouter
//!     endpoint: https://openrouter.ai/api/v1
//!     api_key: ${OPENROUTER_API_KEY}
//!     transform: [openrouter, enhancetool]
//!     models:
//!       kimi: moonshotai/kimi-k2
//! ```

mod tunables;

pub use tunables::Tunables;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// A model entry is either a plain backend model name or an expanded form
/// with per-model overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModelConfig {
    Name(String),
    Expanded {
        model: String,
        #[serde(default)]
        max_tokens: u64,
        #[serde(default)]
        transform: Vec<String>,
        #[serde(default)]
        params: Map<String, Value>,
    },
}

/// One OpenAI-compatible provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Cap on `max_tokens` for this provider (0 = no cap).
    #[serde(default)]
    pub max_tokens: u64,
    /// Transform chain; auto-detected from the provider name when empty.
    #[serde(default)]
    pub transform: Vec<String>,
    /// Extra request parameters injected by the `customparams` transform.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// label → backend model name or expanded config.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl ProvidersConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_yaml::from_str(&data).context("parse config")
    }
}

/// The result of resolving a model label. Immutable after load.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    /// e.g. "http://localhost:11434/v1", trailing slash stripped.
    pub endpoint: String,
    /// Backend model name, e.g. "qwen3:32b".
    pub model: String,
    /// Resolved API key (empty if none).
    pub api_key: String,
    /// The label the client used, e.g. "fast".
    pub label: String,
    pub provider: String,
    /// Cap on `max_tokens` (0 = no cap).
    pub max_tokens: u64,
    pub transform: Vec<String>,
    pub params: Map<String, Value>,
}

/// Resolves model labels to provider details.
#[derive(Debug)]
pub struct ModelResolver {
    models: HashMap<String, ResolvedModel>,
}

impl ModelResolver {
    pub fn new(cfg: &ProvidersConfig) -> Result<Self> {
        let mut models = HashMap::new();

        for p in &cfg.providers {
            if p.name.is_empty() {
                bail!("provider missing name");
            }
            let endpoint = p.endpoint.trim_end_matches('/').to_string();
            if endpoint.is_empty() {
                bail!("provider {:?} missing endpoint", p.name);
            }
            let api_key = expand_env_vars(&p.api_key);
            let provider_transform = detect_transform(&p.transform, &p.name);

            for (label, mc) in &p.models {
                if models.contains_key(label) {
                    bail!("duplicate model label {label:?}");
                }

                let (model, mc_max_tokens, mc_transform, mc_params) = match mc {
                    ModelConfig::Name(model) => (model.clone(), 0, &[][..], None),
                    ModelConfig::Expanded {
                        model,
                        max_tokens,
                        transform,
                        params,
                    } => (
                        model.clone(),
                        *max_tokens,
                        transform.as_slice(),
                        Some(params),
                    ),
                };

                // Per-model settings replace provider-level ones.
                let transform = if mc_transform.is_empty() {
                    provider_transform.clone()
                } else {
                    mc_transform.to_vec()
                };
                let max_tokens = if mc_max_tokens > 0 {
                    mc_max_tokens
                } else {
                    p.max_tokens
                };
                let params = match mc_params {
                    Some(params) if !params.is_empty() => params.clone(),
                    _ => p.params.clone(),
                };

                models.insert(
                    label.clone(),
                    ResolvedModel {
                        endpoint: endpoint.clone(),
                        model,
                        api_key: api_key.clone(),
                        label: label.clone(),
                        provider: p.name.clone(),
                        max_tokens,
                        transform,
                        params,
                    },
                );
            }
        }

        Ok(Self { models })
    }

    pub fn resolve(&self, label: &str) -> Result<&ResolvedModel> {
        self.models
            .get(label)
            .ok_or_else(|| anyhow::anyhow!("unknown model label {label:?}"))
    }
}

fn env_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex"))
}

/// Replace `${VAR}` references with environment variable values.
fn expand_env_vars(s: &str) -> String {
    env_var_re()
        .replace_all(s, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Use the explicit chain if set, else auto-detect a schema cleaner from the
/// provider name.
fn detect_transform(explicit: &[String], provider_name: &str) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let name = provider_name.to_lowercase();
    for known in ["openai", "gemini", "ollama"] {
        if name.contains(known) {
            return vec![format!("schema:{known}")];
        }
    }
    vec!["schema:generic".to_string()]
}
