//! HTTP clients for the chat server

mod assistant;
mod chats;

pub use assistant::{
    Assistant, AssistantClient, AssistantReply, AssistantRequest, ModelAssistant, ReplyMode,
};
pub use chats::ChatsClient;

use std::time::Duration;

use reqwest::{RequestBuilder, Response};

use crate::retry::transport_error;
use crate::{Error, Result};

/// Default address of the chat server
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection details shared by the clients
#[derive(Debug, Clone)]
pub struct ServerConnection {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ServerConnection {
    /// Connect to `base_url`, authenticating with `token` when given
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Base URL without a trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Send a request, mapping transport failures and non-2xx statuses
async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await.map_err(transport_error)?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::server(status, body))
}
