//! Chat persistence over HTTP

use async_trait::async_trait;

use super::{ServerConnection, send};
use crate::conversation::{ChatBackend, Conversation};
use crate::protocol::{ChatEnvelope, ChatListEnvelope, ChatPayload, SaveChatRequest};
use crate::{Error, Result};

/// [`ChatBackend`] backed by the server's `/chats` endpoints
#[derive(Debug, Clone)]
pub struct ChatsClient {
    conn: ServerConnection,
}

impl ChatsClient {
    #[must_use]
    pub const fn new(conn: ServerConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ChatBackend for ChatsClient {
    async fn save(&self, conversation: &Conversation) -> Result<()> {
        let body = SaveChatRequest::from_conversation(conversation);
        let response = send(self.conn.post("/chats/save").json(&body)).await?;
        let envelope: ChatEnvelope<ChatPayload> = response.json().await?;

        tracing::debug!(
            chat_id = %envelope.chat.chat_id,
            messages = envelope.chat.conversation.len(),
            "chat saved to server"
        );
        Ok(())
    }

    async fn load(&self, chat_id: &str) -> Result<Option<Conversation>> {
        let path = format!("/chats/{}", encode_segment(chat_id));
        match send(self.conn.get(&path)).await {
            Ok(response) => {
                let envelope: ChatEnvelope<ChatPayload> = response.json().await?;
                Ok(Some(envelope.chat.into()))
            }
            Err(Error::Server { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn history(&self) -> Result<Vec<Conversation>> {
        let response = send(self.conn.get("/chats/history")).await?;
        let envelope: ChatListEnvelope<ChatPayload> = response.json().await?;
        Ok(envelope.chats.into_iter().map(Conversation::from).collect())
    }
}

/// Percent-encode a chat id for use as one path segment
fn encode_segment(segment: &str) -> String {
    segment
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                char::from(b).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}
