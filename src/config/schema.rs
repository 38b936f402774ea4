use crate::error::{DepotError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Backend used for references without a recognized prefix
    #[serde(default = "default_transport")]
    pub default: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Container engine binary; detected from PATH when unset
    #[serde(default)]
    pub binary: Option<String>,
    /// `auto`, `artifact`, `image` or `http`
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request timeout for metadata calls; transfers are not time-limited
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_huggingface_endpoint")]
    pub huggingface_endpoint: String,
    #[serde(default = "default_modelscope_endpoint")]
    pub modelscope_endpoint: String,
    #[serde(default = "default_ollama_registry")]
    pub ollama_registry: String,
    /// Local Ollama cache whose blobs are reused instead of downloaded
    #[serde(default = "default_ollama_models_dir")]
    pub ollama_models_dir: Option<PathBuf>,
}

// Default value functions
fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("depot/store")
}
fn default_transport() -> String {
    "ollama".to_string()
}
fn default_strategy() -> String {
    "auto".to_string()
}
fn default_user_agent() -> String {
    format!("depot/{}", env!("CARGO_PKG_VERSION"))
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_progress_interval_ms() -> u64 {
    100
}
fn default_huggingface_endpoint() -> String {
    "https://huggingface.co".to_string()
}
fn default_modelscope_endpoint() -> String {
    "https://modelscope.cn".to_string()
}
fn default_ollama_registry() -> String {
    "registry.ollama.ai".to_string()
}
fn default_ollama_models_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ollama/models"))
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default: default_transport(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: None,
            strategy: default_strategy(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            huggingface_endpoint: default_huggingface_endpoint(),
            modelscope_endpoint: default_modelscope_endpoint(),
            ollama_registry: default_ollama_registry(),
            ollama_models_dir: default_ollama_models_dir(),
        }
    }
}

impl EngineConfig {
    /// Configured engine, or the first of podman/docker found on PATH
    #[must_use]
    pub fn resolve_binary(&self) -> Option<PathBuf> {
        match &self.binary {
            Some(binary) => which::which(binary).ok().or_else(|| Some(PathBuf::from(binary))),
            None => ["podman", "docker"].iter().find_map(|b| which::which(b).ok()),
        }
    }
}

/// Get config file path
#[must_use]
pub fn config_path() -> PathBuf {
    let config_dir = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| PathBuf::from(".config"));
    config_dir.join("depot/config.toml")
}

impl Config {
    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| DepotError::Config(format!("Failed to parse {}: {e}", path.display())))
    }

    /// Save config atomically (tmp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| DepotError::Config(format!("Failed to serialize config: {e}")))?;
        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }
}
