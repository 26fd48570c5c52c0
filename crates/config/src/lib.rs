//! Configuration loading, validation, and management for Kōhai.
//!
//! Loads configuration from `~/.kohai/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use kohai_core::DecodeConfig;

/// System directive used when the caller selects Indonesian.
const DEFAULT_PROMPT_ID: &str = "Anda adalah Waguri, asisten AI yang cerdas, ramah, dan membantu \
     dalam Bahasa Indonesia. Jawablah dengan sopan dan informatif.";

/// System directive used when the caller selects English.
const DEFAULT_PROMPT_EN: &str = "You are Waguri, a smart, friendly, and helpful AI assistant. \
     Please answer in English politely and informatively.";

/// The root configuration structure.
///
/// Maps directly to `~/.kohai/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Model and adapter sources
    #[serde(default)]
    pub model: ModelConfig,

    /// Sampling and token-budget settings
    #[serde(default)]
    pub decode: DecodeConfig,

    /// System directives per language
    #[serde(default)]
    pub prompts: PromptsConfig,

    /// HTTP server settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base model repo on the Hugging Face hub (config + tokenizer + weights)
    #[serde(default = "default_base_model")]
    pub base_model: String,

    /// Adapter repo holding the named LoRA adapters. Absent ⇒ the service
    /// runs the bare base model (degraded mode).
    #[serde(default = "default_adapter_repo", skip_serializing_if = "Option::is_none")]
    pub adapter_repo: Option<String>,

    /// "auto" (CUDA when available), "cuda", or "cpu"
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_base_model() -> String {
    "Qwen/Qwen2.5-1.5B-Instruct".into()
}
fn default_adapter_repo() -> Option<String> {
    Some("lumicero/Qwen2.5-bilingual-xlora".into())
}
fn default_device() -> String {
    "auto".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_model: default_base_model(),
            adapter_repo: default_adapter_repo(),
            device: default_device(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Directive for `lang = "id"` (the primary deployment language)
    #[serde(default = "default_prompt_id")]
    pub indonesian: String,

    /// Directive for `lang = "en"`
    #[serde(default = "default_prompt_en")]
    pub english: String,
}

fn default_prompt_id() -> String {
    DEFAULT_PROMPT_ID.into()
}
fn default_prompt_en() -> String {
    DEFAULT_PROMPT_EN.into()
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            indonesian: default_prompt_id(),
            english: default_prompt_en(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// CORS origins. `["*"]` allows any origin (the default — the service
    /// fronts a static web page served elsewhere).
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_allowed_origins() -> Vec<String> {
    vec!["*".into()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.kohai/config.toml).
    ///
    /// Environment variable overrides (highest priority):
    /// - `KOHAI_BASE_MODEL`
    /// - `KOHAI_ADAPTER_REPO` (empty string disables adapters)
    /// - `KOHAI_PORT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(base) = std::env::var("KOHAI_BASE_MODEL") {
            config.model.base_model = base;
        }
        if let Ok(repo) = std::env::var("KOHAI_ADAPTER_REPO") {
            config.model.adapter_repo = if repo.is_empty() { None } else { Some(repo) };
        }
        if let Ok(port) = std::env::var("KOHAI_PORT") {
            config.gateway.port = port
                .parse()
                .map_err(|_| ConfigError::ValidationError(format!("KOHAI_PORT is not a port number: {port}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".kohai")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.decode
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.model.base_model.is_empty() {
            return Err(ConfigError::ValidationError(
                "model.base_model must not be empty".into(),
            ));
        }
        if self.prompts.indonesian.is_empty() || self.prompts.english.is_empty() {
            return Err(ConfigError::ValidationError(
                "both system prompts must be non-empty".into(),
            ));
        }
        if self.gateway.allowed_origins.is_empty() {
            return Err(ConfigError::ValidationError(
                "gateway.allowed_origins must name at least one origin (use \"*\" for any)".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for first-run setup).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
