//! Completions from an OpenAI-compatible chat API
//!
//! Works against any server implementing `POST {base}/chat/completions`
//! (OpenAI, Ollama, vLLM, llama.cpp server). Streaming replies arrive as SSE
//! `data:` lines carrying `choices[0].delta.content`.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::retry::transport_error;
use crate::sse::{Frame, LineBuffer};
use crate::{Error, Result};

/// Default OpenAI-compatible endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Model used when a request names none
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// A single-turn prompt
#[derive(Debug, Clone)]
pub struct Prompt {
    pub model: Option<String>,
    pub system: String,
    pub message: String,
}

/// Stream of reply fragments in arrival order
pub type Deltas = BoxStream<'static, Result<String>>;

/// Something that completes prompts
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Full reply text
    async fn complete(&self, prompt: Prompt) -> Result<String>;

    /// Reply fragments as they are generated
    async fn stream(&self, prompt: Prompt) -> Result<Deltas>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [WireMessage<'a>; 2],
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// `OpenAI`-compatible HTTP client
#[derive(Debug, Clone)]
pub struct OpenAiCompat {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompat {
    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`)
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Model used when a prompt does not name one
    #[must_use]
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    async fn post(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response> {
        let model = prompt
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.default_model);

        let body = CompletionRequest {
            model,
            messages: [
                WireMessage {
                    role: "system",
                    content: &prompt.system,
                },
                WireMessage {
                    role: "user",
                    content: &prompt.message,
                },
            ],
            stream,
        };

        tracing::debug!(model, stream, "requesting completion");

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::server(status, body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompat {
    async fn complete(&self, prompt: Prompt) -> Result<String> {
        let response = self.post(&prompt, false).await?;
        let body: serde_json::Value = response.json().await?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Server {
                status: 502,
                body: "completion carried no message content".to_string(),
            })
    }

    async fn stream(&self, prompt: Prompt) -> Result<Deltas> {
        let response = self.post(&prompt, true).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut lines = LineBuffer::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(transport_error(e)));
                        return;
                    }
                };

                for frame in lines.push(&chunk) {
                    let payload = match frame {
                        Frame::Done => return,
                        Frame::Data(payload) => payload,
                    };
                    match parse_delta(&payload) {
                        Ok(Some(delta)) => {
                            if tx.send(Ok(delta)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
            }
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Text fragment of one streamed completion chunk, if any
fn parse_delta(payload: &str) -> Result<Option<String>> {
    let chunk: serde_json::Value = serde_json::from_str(payload)?;
    Ok(chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}
