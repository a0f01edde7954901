//! Bearer token authentication middleware

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::{ApiError, ApiState};

/// The user a request was authenticated as, stored in request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

/// Extract the bearer token from the Authorization header
fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Middleware resolving the bearer token to an [`AuthUser`]
pub async fn require_user(
    State(state): State<Arc<ApiState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(token) = extract_bearer(&req) else {
        tracing::debug!("no bearer token provided");
        return Err(ApiError::Unauthorized);
    };

    let user = if state.tokens.is_empty() {
        // Development mode: the bearer value names the user
        tracing::warn!("bearer tokens not configured - trusting bearer value as user id");
        token.to_string()
    } else if let Some(user) = state.tokens.get(token) {
        user.clone()
    } else {
        tracing::warn!("invalid bearer token provided");
        return Err(ApiError::Unauthorized);
    };

    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}
