use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const PROMPT_KEY: &str = "system_prompt";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("no system prompt configured (expected 'system_prompt' or 'system_prompt_<name>')")]
    NoSystemPrompt,
    #[error("key '{key}' must be a string")]
    InvalidPrompt { key: String },
    #[error("key '{key}' does not name a valid endpoint")]
    InvalidEndpointName { key: String },
}

/// Process-wide configuration, loaded once before anything is served.
#[derive(Debug, Clone)]
pub struct Config {
    pub model_path: PathBuf,
    pub endpoints: Vec<Endpoint>,
    pub model: ModelSettings,
    pub server: ServerSettings,
}

/// A chat route and the system prompt bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub route: String,
    pub system_prompt: String,
}

/// Static llama.cpp parameters passed once at model load.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Context window size in tokens
    pub n_ctx: u32,
    /// Prompt evaluation batch size
    pub n_batch: u32,
    /// Number of layers offloaded to the GPU
    pub n_gpu_layers: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_gpu_layers: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Deserialize)]
struct RawConfig {
    model_path: Option<PathBuf>,
    #[serde(default)]
    model: ModelSettings,
    #[serde(default)]
    server: ServerSettings,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_yaml::Value>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        let model_path = raw.model_path.ok_or(ConfigError::MissingKey("model_path"))?;

        let mut endpoints = Vec::new();
        for (key, value) in raw.rest {
            let Some(route) = route_for_key(&key)? else {
                warn!("Ignoring unknown config key '{}'", key);
                continue;
            };
            let serde_yaml::Value::String(system_prompt) = value else {
                return Err(ConfigError::InvalidPrompt { key });
            };
            endpoints.push(Endpoint {
                route,
                system_prompt,
            });
        }

        if endpoints.is_empty() {
            return Err(ConfigError::NoSystemPrompt);
        }

        Ok(Self {
            model_path,
            endpoints,
            model: raw.model,
            server: raw.server,
        })
    }
}

/// Maps `system_prompt` to `/chat` and `system_prompt_<name>` to `/chat_<name>`.
/// Returns `None` for keys that are not prompt keys at all.
fn route_for_key(key: &str) -> Result<Option<String>, ConfigError> {
    let Some(suffix) = key.strip_prefix(PROMPT_KEY) else {
        return Ok(None);
    };
    if suffix.is_empty() {
        return Ok(Some("/chat".to_string()));
    }
    let Some(name) = suffix.strip_prefix('_') else {
        return Ok(None);
    };
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ConfigError::InvalidEndpointName {
            key: key.to_string(),
        });
    }
    Ok(Some(format!("/chat_{}", name)))
}
