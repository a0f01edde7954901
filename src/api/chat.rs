//! Assistant completion endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{State, rejection::JsonRejection},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
};
use futures::StreamExt;

use super::{ApiError, ApiState};
use crate::llm::Prompt;
use crate::protocol::{ChatReply, ChatRequest};
use crate::sse::{DONE, encode_text};

/// Language reported by `/voice-chat` when the request names none
pub const DEFAULT_LANGUAGE: &str = "en";

/// Build the completion router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/voice-chat", post(voice_chat))
        .with_state(state)
}

fn prompt(request: ChatRequest, default_system: &str) -> Result<Prompt, ApiError> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("No message provided"));
    }

    let system = request
        .system_prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| default_system.to_string());

    Ok(Prompt {
        model: request.model.map(|m| m.trim().to_string()),
        system,
        message: message.to_string(),
    })
}

async fn chat(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let stream = request.stream;
    let prompt = prompt(request, &state.prompts.chat)?;
    let llm = state.model()?;

    if !stream {
        let response = llm.complete(prompt).await?;
        return Ok(Json(ChatReply {
            success: true,
            response,
            language: None,
        })
        .into_response());
    }

    let deltas = llm.stream(prompt).await?;
    let lines = deltas
        .map(|delta| match delta {
            Ok(text) => Ok(Bytes::from(encode_text(&text))),
            Err(e) => {
                tracing::warn!(error = %e, "completion stream failed");
                Err(std::io::Error::other(e.to_string()))
            }
        })
        .chain(futures::stream::once(async {
            Ok(Bytes::from(format!("data: {DONE}\n")))
        }));

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn voice_chat(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatReply>, ApiError> {
    let Json(request) = body?;
    let language = request
        .language
        .clone()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
    let prompt = prompt(request, &state.prompts.voice)?;
    let response = state.model()?.complete(prompt).await?;

    tracing::debug!(language = %language, chars = response.len(), "voice reply generated");

    Ok(Json(ChatReply {
        success: true,
        response,
        language: Some(language),
    }))
}
