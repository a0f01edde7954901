//! HTTP API server: chat persistence and assistant completions

mod auth;
pub mod chat;
pub mod chats;
pub mod health;

pub use auth::AuthUser;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::{ChatRepo, DbPool};
use crate::llm::ChatModel;
use crate::protocol::Failure;
use crate::Result;

/// Default system prompt for `/chat`
pub const CHAT_PROMPT: &str = "You are a conversational assistant.";

/// Default system prompt for `/voice-chat`
pub const VOICE_PROMPT: &str = "You are a conversational assistant. Keep responses brief and natural.";

/// System prompts applied when a request carries none
#[derive(Debug, Clone)]
pub struct Prompts {
    pub chat: String,
    pub voice: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            chat: CHAT_PROMPT.to_string(),
            voice: VOICE_PROMPT.to_string(),
        }
    }
}

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub chats: ChatRepo,
    /// Bearer token → user id. Empty means development mode.
    pub tokens: HashMap<String, String>,
    pub llm: Option<Arc<dyn ChatModel>>,
    pub prompts: Prompts,
}

impl ApiState {
    /// State with no tokens and no language model
    #[must_use]
    pub fn new(db: DbPool) -> Self {
        Self {
            chats: ChatRepo::new(db),
            tokens: HashMap::new(),
            llm: None,
            prompts: Prompts::default(),
        }
    }

    fn model(&self) -> std::result::Result<&Arc<dyn ChatModel>, ApiError> {
        self.llm
            .as_ref()
            .ok_or(ApiError::Unavailable("No language model configured"))
    }
}

/// Build the full router for `state`
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/chats", chats::router(state.clone()))
        .merge(chat::router(state))
        .merge(health::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    db: DbPool,
    host: String,
    port: u16,
    tokens: HashMap<String, String>,
    llm: Option<Arc<dyn ChatModel>>,
    prompts: Prompts,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(db: DbPool, port: u16) -> Self {
        Self {
            db,
            host: "0.0.0.0".to_string(),
            port,
            tokens: HashMap::new(),
            llm: None,
            prompts: Prompts::default(),
        }
    }

    /// Interface to bind
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Accepted bearer tokens and the user each one authenticates
    #[must_use]
    pub fn tokens(mut self, tokens: HashMap<String, String>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Language model answering `/chat` and `/voice-chat`
    #[must_use]
    pub fn llm(mut self, llm: Arc<dyn ChatModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    #[must_use]
    pub fn prompts(mut self, prompts: Prompts) -> Self {
        self.prompts = prompts;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let state = Arc::new(ApiState {
            chats: ChatRepo::new(self.db),
            tokens: self.tokens,
            llm: self.llm,
            prompts: self.prompts,
        });

        ApiServer {
            state,
            host: self.host,
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
}

impl ApiServer {
    /// Router with all routes and layers
    #[must_use]
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Run the API server until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if self.state.tokens.is_empty() {
            tracing::warn!("no bearer tokens configured - bearer values are taken as user ids");
        }
        if self.state.llm.is_none() {
            tracing::warn!("no language model configured - /chat and /voice-chat will return 503");
        }

        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(addr = %addr, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

/// Errors returned by handlers as `{success: false, message}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    /// Body that failed to parse as the expected JSON
    Malformed(String),
    Unauthorized,
    NotFound(&'static str),
    Unavailable(&'static str),
    Internal(String),
}

impl From<crate::Error> for ApiError {
    fn from(e: crate::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Malformed(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.to_string()),
            Self::Malformed(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Not authorized".to_string()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.to_string()),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.to_string()),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (
            status,
            Json(Failure {
                success: false,
                message,
            }),
        )
            .into_response()
    }
}
