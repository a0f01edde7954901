//! Configuration management
//!
//! Values are layered env > `config.toml` > defaults.

mod file;

pub use file::{ConfigFile, config_file_path, load_config_file, load_from, parse};

use std::collections::HashMap;
use std::path::PathBuf;

use crate::api::{CHAT_PROMPT, Prompts, VOICE_PROMPT};
use crate::client::DEFAULT_BASE_URL;
use crate::turn::CONFIDENCE_THRESHOLD;
use crate::voice::{DEFAULT_LISTEN_URL, DEFAULT_SPEAK_URL, DEFAULT_STT_MODEL, SAMPLE_RATE};

/// Default API server port
pub const DEFAULT_PORT: u16 = 5000;

/// Chat server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Bearer token → user id; empty means development mode
    pub tokens: HashMap<String, String>,
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend_url: String,
    pub token: Option<String>,
    pub model: Option<String>,
    pub user_id: String,
    pub cache_dir: PathBuf,
}

/// Voice settings
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub stt_url: String,
    pub stt_model: String,
    pub language: Option<String>,
    pub sample_rate: u32,
    pub endpointing_ms: u32,
    pub confidence_threshold: f64,
    pub tts_url: String,
    pub tts_model: Option<String>,
    pub muted: bool,
    pub streamed: bool,
}

/// Completion backend settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub prompts: Prompts,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub deepgram: Option<String>,
    pub openai: Option<String>,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub voice: VoiceConfig,
    pub llm: LlmConfig,
    pub api_keys: ApiKeys,
}

impl Config {
    /// Load from the process environment and the standard config file
    #[must_use]
    pub fn load() -> Self {
        Self::from_sources(load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve `file` under the variables returned by `env`
    #[must_use]
    pub fn from_sources(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let port = env("AUDIOSMITH_PORT")
            .or_else(|| env("PORT"))
            .and_then(|p| match p.parse() {
                Ok(port) => Some(port),
                Err(e) => {
                    tracing::warn!(value = %p, error = %e, "ignoring invalid port");
                    None
                }
            })
            .or(file.server.port)
            .unwrap_or(DEFAULT_PORT);

        let server = ServerConfig {
            host: env("AUDIOSMITH_HOST")
                .or(file.server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            db_path: env("AUDIOSMITH_DB")
                .or(file.server.db_path)
                .map_or_else(default_db_path, PathBuf::from),
            tokens: file.server.tokens,
        };

        let client = ClientConfig {
            backend_url: env("AUDIOSMITH_BACKEND_URL")
                .or(file.client.backend_url)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token: env("AUDIOSMITH_TOKEN").or(file.client.token),
            model: env("AUDIOSMITH_MODEL").or(file.client.model),
            user_id: file.client.user_id.unwrap_or_else(|| "local".to_string()),
            cache_dir: file
                .client
                .cache_dir
                .map_or_else(default_cache_dir, PathBuf::from),
        };

        let voice = VoiceConfig {
            stt_url: file
                .voice
                .stt_url
                .unwrap_or_else(|| DEFAULT_LISTEN_URL.to_string()),
            stt_model: file
                .voice
                .stt_model
                .unwrap_or_else(|| DEFAULT_STT_MODEL.to_string()),
            language: env("AUDIOSMITH_LANGUAGE").or(file.voice.language),
            sample_rate: file.voice.sample_rate.unwrap_or(SAMPLE_RATE),
            endpointing_ms: file.voice.endpointing_ms.unwrap_or(300),
            confidence_threshold: file
                .voice
                .confidence_threshold
                .unwrap_or(CONFIDENCE_THRESHOLD),
            tts_url: file
                .voice
                .tts_url
                .unwrap_or_else(|| DEFAULT_SPEAK_URL.to_string()),
            tts_model: file.voice.tts_model,
            muted: file.voice.muted.unwrap_or(false),
            streamed: file.voice.streamed.unwrap_or(false),
        };

        let llm = LlmConfig {
            base_url: env("LLM_BASE_URL")
                .or(file.llm.base_url)
                .unwrap_or_else(|| crate::llm::DEFAULT_BASE_URL.to_string()),
            model: file
                .llm
                .model
                .unwrap_or_else(|| crate::llm::DEFAULT_MODEL.to_string()),
            prompts: Prompts {
                chat: file.llm.chat_prompt.unwrap_or_else(|| CHAT_PROMPT.to_string()),
                voice: file
                    .llm
                    .voice_prompt
                    .unwrap_or_else(|| VOICE_PROMPT.to_string()),
            },
        };

        let api_keys = ApiKeys {
            deepgram: env("DEEPGRAM_API_KEY").or(file.api_keys.deepgram),
            openai: env("OPENAI_API_KEY").or(file.api_keys.openai),
        };

        Self {
            server,
            client,
            voice,
            llm,
            api_keys,
        }
    }
}

fn default_db_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("audiosmith.db"),
        |d| d.data_dir().join("audiosmith").join("chats.db"),
    )
}

fn default_cache_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".audiosmith-cache"),
        |d| d.cache_dir().join("audiosmith").join("conversations"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = Config::from_sources(ConfigFile::default(), env_from(&[]));
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.client.backend_url, DEFAULT_BASE_URL);
        assert!(config.voice.language.is_none());
        assert!((config.voice.confidence_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.llm.prompts.chat, CHAT_PROMPT);
        assert!(config.api_keys.deepgram.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let mut file = ConfigFile::default();
        file.server.port = Some(7000);
        file.client.token = Some("from-file".into());
        file.api_keys.deepgram = Some("file-key".into());

        let config = Config::from_sources(
            file,
            env_from(&[
                ("PORT", "9000"),
                ("AUDIOSMITH_TOKEN", "from-env"),
                ("DEEPGRAM_API_KEY", ""),
            ]),
        );

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.client.token.as_deref(), Some("from-env"));
        // Empty env values do not mask the file
        assert_eq!(config.api_keys.deepgram.as_deref(), Some("file-key"));
    }

    #[test]
    fn specific_port_wins_over_generic() {
        let config = Config::from_sources(
            ConfigFile::default(),
            env_from(&[("PORT", "9000"), ("AUDIOSMITH_PORT", "9100")]),
        );
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn invalid_port_falls_through() {
        let mut file = ConfigFile::default();
        file.server.port = Some(7000);
        let config = Config::from_sources(file, env_from(&[("AUDIOSMITH_PORT", "abc")]));
        assert_eq!(config.server.port, 7000);
    }
}
