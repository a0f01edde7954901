//! TOML configuration file loading
//!
//! Supports `~/.config/audiosmith/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub client: ClientFileConfig,

    #[serde(default)]
    pub voice: VoiceFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Chat server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// `SQLite` database path
    pub db_path: Option<String>,
    /// Bearer token → user id
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Client-side configuration
#[derive(Debug, Default, Deserialize)]
pub struct ClientFileConfig {
    /// Chat server base URL
    pub backend_url: Option<String>,
    /// Bearer token presented to the server
    pub token: Option<String>,
    /// Assistant model requested per turn
    pub model: Option<String>,
    /// User id for local (serverless) mode
    pub user_id: Option<String>,
    /// Directory for the local conversation cache
    pub cache_dir: Option<String>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    pub stt_url: Option<String>,
    pub stt_model: Option<String>,
    /// Recognition language; unset means auto-detect
    pub language: Option<String>,
    /// Capture sample rate when no device dictates one
    pub sample_rate: Option<u32>,
    pub endpointing_ms: Option<u32>,
    pub confidence_threshold: Option<f64>,
    pub tts_url: Option<String>,
    pub tts_model: Option<String>,
    /// Show replies without speaking them
    pub muted: Option<bool>,
    /// Request streamed replies
    pub streamed: Option<bool>,
}

/// LLM backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible base URL
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub chat_prompt: Option<String>,
    pub voice_prompt: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub deepgram: Option<String>,
    pub openai: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ConfigFile {
    config_file_path().map_or_else(ConfigFile::default, |path| load_from(&path))
}

/// Load a config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> ConfigFile {
    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns [`crate::Error::Toml`] if the contents are not a valid config
pub fn parse(content: &str) -> crate::Result<ConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/audiosmith/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("audiosmith").join("config.toml"))
}
