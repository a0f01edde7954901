//! Text-to-speech (TTS) synthesis

use async_trait::async_trait;

use crate::retry::transport_error;
use crate::{Error, Result};

/// Default vendor endpoint
pub const DEFAULT_SPEAK_URL: &str = "https://api.deepgram.com/v1/speak";

/// Turns text into encoded audio
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text`, returning encoded audio (MP3)
    async fn synthesize(&self, text: &str, language: Option<&str>) -> Result<Vec<u8>>;
}

/// Deepgram `POST /v1/speak`
#[derive(Debug, Clone)]
pub struct DeepgramTts {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: Option<String>,
}

impl DeepgramTts {
    /// Create a new TTS instance
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url: DEFAULT_SPEAK_URL.to_string(),
            api_key,
            model: None,
        })
    }

    /// Override the endpoint
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Voice model, e.g. `aura-asteria-en`
    #[must_use]
    pub fn model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramTts {
    async fn synthesize(&self, text: &str, language: Option<&str>) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct SpeakRequest<'a> {
            text: &'a str,
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Synthesis("text must be non-empty".to_string()));
        }

        let mut request = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&SpeakRequest { text });
        if let Some(model) = &self.model {
            request = request.query(&[("model", model)]);
        }

        let response = request.send().await.map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::server(status, body));
        }

        let audio = response.bytes().await.map_err(transport_error)?;

        tracing::debug!(
            chars = text.len(),
            bytes = audio.len(),
            language = language.unwrap_or_default(),
            "speech synthesized"
        );
        Ok(audio.to_vec())
    }
}
