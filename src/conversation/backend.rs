//! Where conversations are persisted

use async_trait::async_trait;

use super::{Conversation, Message};
use crate::Result;
use crate::db::ChatRepo;

/// Durable home of conversations, keyed by chat id for the current user
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Upsert the persisted transcript of `conversation`
    async fn save(&self, conversation: &Conversation) -> Result<()>;

    /// Load one conversation; `Ok(None)` when it does not exist
    async fn load(&self, chat_id: &str) -> Result<Option<Conversation>>;

    /// All of the user's conversations, most recent first
    async fn history(&self) -> Result<Vec<Conversation>>;
}

/// Backend writing straight to the local database, for running without a server
#[derive(Clone)]
pub struct LocalChats {
    repo: ChatRepo,
    user_id: String,
}

impl LocalChats {
    #[must_use]
    pub fn new(repo: ChatRepo, user_id: impl Into<String>) -> Self {
        Self {
            repo,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl ChatBackend for LocalChats {
    async fn save(&self, conversation: &Conversation) -> Result<()> {
        let transcript: Vec<Message> = conversation.transcript().cloned().collect();
        self.repo.upsert(
            &self.user_id,
            &conversation.id,
            &conversation.title,
            &transcript,
        )?;
        Ok(())
    }

    async fn load(&self, chat_id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .repo
            .find(&self.user_id, chat_id)?
            .map(Conversation::from))
    }

    async fn history(&self) -> Result<Vec<Conversation>> {
        Ok(self
            .repo
            .list(&self.user_id)?
            .into_iter()
            .map(Conversation::from)
            .collect())
    }
}
