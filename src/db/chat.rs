//! Chat document repository

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::conversation::{Conversation, Message};
use crate::{Error, Result};

/// A persisted chat transcript, unique per (user, chat)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDocument {
    pub chat_id: String,
    pub user_id: String,
    pub title: String,
    pub conversation: Vec<Message>,
    pub last_updated: DateTime<Utc>,
}

impl From<ChatDocument> for Conversation {
    fn from(doc: ChatDocument) -> Self {
        Self {
            id: doc.chat_id,
            title: doc.title,
            messages: doc.conversation,
        }
    }
}

/// Chat repository
#[derive(Clone)]
pub struct ChatRepo {
    pool: DbPool,
}

impl ChatRepo {
    /// Create a new chat repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert or replace the transcript for `(user_id, chat_id)`
    ///
    /// Only `content`, `role` and `timestamp` are stored for each message.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(
        &self,
        user_id: &str,
        chat_id: &str,
        title: &str,
        conversation: &[Message],
    ) -> Result<ChatDocument> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversation: Vec<Message> = conversation
            .iter()
            .map(|m| Message {
                is_final: None,
                ..m.clone()
            })
            .collect();
        let body = serde_json::to_string(&conversation)?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO chats (chat_id, user_id, title, conversation, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id, chat_id) DO UPDATE SET
                title = excluded.title,
                conversation = excluded.conversation,
                last_updated = excluded.last_updated",
            params![chat_id, user_id, title, body, now.to_rfc3339()],
        )?;

        tracing::debug!(
            chat_id,
            user_id,
            messages = conversation.len(),
            "chat saved"
        );

        Ok(ChatDocument {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            conversation,
            last_updated: now,
        })
    }

    /// Find one chat owned by `user_id`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, user_id: &str, chat_id: &str) -> Result<Option<ChatDocument>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let raw = conn
            .query_row(
                "SELECT chat_id, user_id, title, conversation, last_updated
                 FROM chats WHERE user_id = ?1 AND chat_id = ?2",
                [user_id, chat_id],
                RawChat::from_row,
            )
            .optional()?;

        raw.map(RawChat::into_document).transpose()
    }

    /// All chats owned by `user_id`, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, user_id: &str) -> Result<Vec<ChatDocument>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT chat_id, user_id, title, conversation, last_updated
             FROM chats WHERE user_id = ?1 ORDER BY last_updated DESC",
        )?;

        let rows = stmt
            .query_map([user_id], RawChat::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawChat::into_document).collect()
    }
}

/// Row as stored, before the transcript JSON is decoded
struct RawChat {
    chat_id: String,
    user_id: String,
    title: String,
    conversation: String,
    last_updated: String,
}

impl RawChat {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            chat_id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            conversation: row.get(3)?,
            last_updated: row.get(4)?,
        })
    }

    fn into_document(self) -> Result<ChatDocument> {
        Ok(ChatDocument {
            conversation: serde_json::from_str(&self.conversation)?,
            last_updated: parse_datetime(&self.last_updated),
            chat_id: self.chat_id,
            user_id: self.user_id,
            title: self.title,
        })
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
