//! JSON bodies shared by the HTTP server and its clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, DEFAULT_TITLE, Message};

fn default_title() -> String {
    DEFAULT_TITLE.to_string()
}

/// `POST /chats/save`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveChatRequest {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub conversation: Option<Vec<Message>>,
}

impl SaveChatRequest {
    /// Request persisting the transcript of `conversation`
    #[must_use]
    pub fn from_conversation(conversation: &Conversation) -> Self {
        Self {
            chat_id: Some(conversation.id.clone()),
            title: Some(conversation.title.clone()),
            conversation: Some(conversation.transcript().cloned().collect()),
        }
    }
}

/// A chat as returned by the `/chats` endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub chat_id: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub conversation: Vec<Message>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl From<ChatPayload> for Conversation {
    fn from(chat: ChatPayload) -> Self {
        Self {
            id: chat.chat_id,
            title: chat.title,
            messages: chat.conversation,
        }
    }
}

/// `{success, chat}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEnvelope<T> {
    pub success: bool,
    pub chat: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `{success, chats}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatListEnvelope<T> {
    pub success: bool,
    pub chats: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `{success: false, message}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub success: bool,
    pub message: String,
}

/// `POST /chat` and `POST /voice-chat`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

/// Non-streamed reply of `POST /chat` and `POST /voice-chat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    #[serde(default = "success_default")]
    pub success: bool,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

const fn success_default() -> bool {
    true
}
