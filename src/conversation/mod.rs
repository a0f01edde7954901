//! Conversation data model and the client-side conversation cache

mod backend;
mod store;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use backend::{ChatBackend, LocalChats};
pub use store::{ConversationStore, StoreOptions};

/// Title given to conversations before their first user message
pub const DEFAULT_TITLE: &str = "New Chat";

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Wire name of the role
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Whether messages with this role belong in the persisted transcript
    #[must_use]
    pub const fn is_persisted(self) -> bool {
        matches!(self, Self::User | Self::Assistant)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub content: String,
    pub role: Role,
    /// Entries saved without one are stamped on arrival
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
}

impl Message {
    /// Create a message stamped with the current time
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role,
            timestamp: Utc::now(),
            is_final: None,
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// An ordered list of messages with an id and a title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Start a conversation with a client-generated temporary id
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Empty conversation with a known id
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
        }
    }

    /// Append a message, naming the conversation after its first user message
    pub fn push(&mut self, message: Message) {
        if message.role == Role::User && self.title == DEFAULT_TITLE {
            let title = derive_title(&message.content);
            if !title.is_empty() {
                self.title = title;
            }
        }
        self.messages.push(message);
    }

    /// Messages that belong in the persisted transcript
    pub fn transcript(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role.is_persisted())
    }

    /// Whether anything worth persisting has been said
    #[must_use]
    pub fn has_transcript(&self) -> bool {
        self.transcript().next().is_some()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("static pattern"));

/// Title from the first three words of `text`, punctuation removed
#[must_use]
pub fn derive_title(text: &str) -> String {
    let clean = NON_WORD.replace_all(text.trim(), " ");
    clean.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}
