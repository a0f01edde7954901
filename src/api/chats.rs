//! Chat transcript persistence endpoints
//!
//! Every route is scoped to the authenticated user: chat ids are only
//! unique per user.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    middleware,
    routing::{get, post},
};

use super::auth::{AuthUser, require_user};
use super::{ApiError, ApiState};
use crate::conversation::DEFAULT_TITLE;
use crate::db::ChatDocument;
use crate::protocol::{ChatEnvelope, ChatListEnvelope, SaveChatRequest};

/// Build the `/chats` router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/save", post(save))
        .route("/history", get(history))
        .route("/{chat_id}", get(find))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user))
        .with_state(state)
}

async fn save(
    State(state): State<Arc<ApiState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Result<Json<SaveChatRequest>, JsonRejection>,
) -> Result<Json<ChatEnvelope<ChatDocument>>, ApiError> {
    let Json(request) = body?;
    let chat_id = request.chat_id.filter(|id| !id.trim().is_empty());
    let (Some(chat_id), Some(conversation)) = (chat_id, request.conversation) else {
        return Err(ApiError::BadRequest("ChatId and conversation are required"));
    };

    if conversation.iter().any(|m| !m.role.is_persisted()) {
        return Err(ApiError::BadRequest(
            "Conversation messages must have role user or assistant",
        ));
    }

    let title = request
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());

    let chat = state
        .chats
        .upsert(&user_id, &chat_id, &title, &conversation)?;

    tracing::info!(
        user_id = %user_id,
        chat_id = %chat_id,
        messages = chat.conversation.len(),
        "chat saved"
    );

    Ok(Json(ChatEnvelope {
        success: true,
        chat,
        message: Some("Chat saved successfully".to_string()),
    }))
}

async fn history(
    State(state): State<Arc<ApiState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<ChatListEnvelope<ChatDocument>>, ApiError> {
    let chats = state.chats.list(&user_id)?;
    tracing::debug!(user_id = %user_id, count = chats.len(), "chat history fetched");

    Ok(Json(ChatListEnvelope {
        success: true,
        chats,
        message: None,
    }))
}

async fn find(
    State(state): State<Arc<ApiState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(chat_id): Path<String>,
) -> Result<Json<ChatEnvelope<ChatDocument>>, ApiError> {
    let chat = state
        .chats
        .find(&user_id, &chat_id)?
        .ok_or(ApiError::NotFound("Chat not found"))?;

    Ok(Json(ChatEnvelope {
        success: true,
        chat,
        message: None,
    }))
}
