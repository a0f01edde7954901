//! Audiosmith - voice-driven chat
//!
//! This library provides:
//! - Streaming speech-to-text over a vendor WebSocket
//! - Turn taking with barge-in: a user who starts speaking interrupts the
//!   assistant's pending reply and playback
//! - Spoken replies through a single-flight playback channel
//! - A debounced client-side conversation cache
//! - The chat server: per-user transcript persistence and completions
//!
//! # Architecture
//!
//! ```text
//! AudioSource ──▶ TranscriptStream ──▶ TurnController ──▶ SpeechPlayback
//!                                           │
//!                                           ├──▶ Assistant (/chat, /voice-chat)
//!                                           │
//!                                           └──▶ ConversationStore ──▶ /chats (SQLite)
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod llm;
pub mod protocol;
pub mod retry;
pub mod sse;
pub mod turn;
pub mod voice;

pub use config::Config;
pub use db::DbPool;
pub use error::{Error, Result};
