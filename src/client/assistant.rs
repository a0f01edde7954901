//! Assistant requests: plain, streamed, and voice replies

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use super::{ServerConnection, send};
use crate::api::Prompts;
use crate::llm::{ChatModel, Prompt};
use crate::protocol::{ChatReply, ChatRequest};
use crate::retry::transport_error;
use crate::sse::{Frame, LineBuffer, decode_text};
use crate::{Error, Result};

/// How the reply should be delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// One JSON body from `/chat`
    #[default]
    Plain,
    /// Chunked `data:` lines from `/chat`
    Streamed,
    /// One JSON body from `/voice-chat`, tagged with a language
    Voice,
}

/// One utterance to send to the assistant
#[derive(Debug, Clone, Default)]
pub struct AssistantRequest {
    pub message: String,
    pub model: Option<String>,
    pub language: Option<String>,
    pub mode: ReplyMode,
}

impl AssistantRequest {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    #[must_use]
    pub const fn mode(mut self, mode: ReplyMode) -> Self {
        self.mode = mode;
        self
    }
}

/// The assistant's complete answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantReply {
    pub content: String,
    pub language: Option<String>,
}

/// Something that answers user utterances
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Ask the assistant and wait for its full reply
    ///
    /// For streamed replies the text accumulated so far is sent on
    /// `partials` after every complete line. Firing `cancel` aborts the
    /// request and yields [`Error::Cancelled`].
    async fn send(
        &self,
        request: AssistantRequest,
        cancel: CancellationToken,
        partials: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<AssistantReply>;
}

/// [`Assistant`] backed by the server's `/chat` and `/voice-chat` endpoints
#[derive(Debug, Clone)]
pub struct AssistantClient {
    conn: ServerConnection,
}

impl AssistantClient {
    #[must_use]
    pub const fn new(conn: ServerConnection) -> Self {
        Self { conn }
    }

    async fn exchange(
        &self,
        request: AssistantRequest,
        partials: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<AssistantReply> {
        let path = match request.mode {
            ReplyMode::Voice => "/voice-chat",
            ReplyMode::Plain | ReplyMode::Streamed => "/chat",
        };
        let streamed = request.mode == ReplyMode::Streamed;
        let body = ChatRequest {
            message: request.message,
            model: request.model,
            system_prompt: None,
            language: request.language.clone(),
            stream: streamed,
        };

        let response = send(self.conn.post(path).json(&body)).await?;

        if streamed {
            let content = read_stream(response, partials.as_ref()).await?;
            return Ok(AssistantReply {
                content,
                language: request.language,
            });
        }

        let reply: ChatReply = response.json().await?;
        Ok(AssistantReply {
            content: reply.response,
            language: reply.language.or(request.language),
        })
    }
}

#[async_trait]
impl Assistant for AssistantClient {
    async fn send(
        &self,
        request: AssistantRequest,
        cancel: CancellationToken,
        partials: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<AssistantReply> {
        let mode = request.mode;
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(?mode, "assistant request cancelled");
                Err(Error::Cancelled)
            }
            reply = self.exchange(request, partials) => reply,
        }
    }
}

/// [`Assistant`] answering straight from a [`ChatModel`], for running
/// without a server
#[derive(Clone)]
pub struct ModelAssistant {
    model: Arc<dyn ChatModel>,
    prompts: Prompts,
}

impl ModelAssistant {
    #[must_use]
    pub fn new(model: Arc<dyn ChatModel>, prompts: Prompts) -> Self {
        Self { model, prompts }
    }

    async fn exchange(
        &self,
        request: AssistantRequest,
        partials: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<AssistantReply> {
        let system = match request.mode {
            ReplyMode::Voice => self.prompts.voice.clone(),
            ReplyMode::Plain | ReplyMode::Streamed => self.prompts.chat.clone(),
        };
        let prompt = Prompt {
            model: request.model,
            system,
            message: request.message,
        };

        if request.mode != ReplyMode::Streamed {
            let content = self.model.complete(prompt).await?;
            return Ok(AssistantReply {
                content,
                language: request.language,
            });
        }

        let mut deltas = self.model.stream(prompt).await?;
        let mut content = String::new();
        while let Some(delta) = deltas.next().await {
            content.push_str(&delta?);
            if let Some(tx) = &partials {
                let _ = tx.send(content.clone());
            }
        }
        Ok(AssistantReply {
            content,
            language: request.language,
        })
    }
}

#[async_trait]
impl Assistant for ModelAssistant {
    async fn send(
        &self,
        request: AssistantRequest,
        cancel: CancellationToken,
        partials: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<AssistantReply> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            reply = self.exchange(request, partials) => reply,
        }
    }
}

/// Concatenate the text of a `data:` stream until `[DONE]`
///
/// A body that ends without the sentinel was cut short and is reported as a
/// network failure rather than a complete reply.
async fn read_stream(
    response: reqwest::Response,
    partials: Option<&mpsc::UnboundedSender<String>>,
) -> Result<String> {
    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::new();
    let mut content = String::new();

    let emit = |frame: Frame, content: &mut String| -> bool {
        match frame {
            Frame::Done => true,
            Frame::Data(payload) => {
                content.push_str(&decode_text(&payload));
                if let Some(tx) = partials {
                    let _ = tx.send(content.clone());
                }
                false
            }
        }
    };

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(transport_error)?;
        for frame in lines.push(&chunk) {
            if emit(frame, &mut content) {
                return Ok(content);
            }
        }
    }

    if lines.finish().is_some_and(|frame| emit(frame, &mut content)) {
        return Ok(content);
    }
    tracing::warn!(chars = content.len(), "reply stream ended before [DONE]");
    Err(Error::Network("stream ended before [DONE]".to_string()))
}
