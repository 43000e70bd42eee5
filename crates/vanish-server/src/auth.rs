use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::AppState;

/// The authenticated caller, inserted as a request extension by
/// [`require_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub username: String,
    /// Raw bearer token of the current session.
    pub token: String,
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum middleware that resolves the session token into an [`Identity`].
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&request).map(str::to_owned) else {
        return unauthorized();
    };

    match state.store.resolve_session(&token) {
        Ok(Some(username)) => {
            request
                .extensions_mut()
                .insert(Identity { username, token });
            next.run(request).await
        }
        Ok(None) => unauthorized(),
        Err(e) => {
            error!(error = %e, "session lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}
