use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    auth::Identity,
    store::{unix_now, FetchResult, Note, NoteDraft, NoteMeta, RegisterError, ValidationError},
    AppState,
};

/// Body of the 404 answered for missing, expired and consumed notes.
pub const GONE_MESSAGE: &str = "this note has expired or been viewed the maximum number of times";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Users ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub username: String,
    pub token: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Response {
    match state.store.register_user(&body.username, &body.password) {
        Ok(user) => match state.store.open_session(&user.username, state.session_ttl_secs) {
            Ok(token) => {
                info!(username = %user.username, "user.register");
                (
                    StatusCode::CREATED,
                    Json(SessionResponse {
                        username: user.username.clone(),
                        token,
                    }),
                )
                    .into_response()
            }
            Err(e) => internal_error(e),
        },
        Err(RegisterError::Invalid(err)) => validation_error(&err),
        Err(RegisterError::UsernameTaken) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "a user with that username already exists"})),
        )
            .into_response(),
        Err(RegisterError::Storage(e)) => internal_error(e),
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Response {
    match state.store.authenticate(&body.username, &body.password) {
        Ok(Some(user)) => match state.store.open_session(&user.username, state.session_ttl_secs) {
            Ok(token) => {
                info!(username = %user.username, "user.login");
                Json(SessionResponse {
                    username: user.username.clone(),
                    token,
                })
                .into_response()
            }
            Err(e) => internal_error(e),
        },
        Ok(None) => {
            warn!(username = %body.username, "user.login failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "please enter a correct username and password"})),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Response {
    match state.store.close_session(&identity.token) {
        Ok(_) => {
            info!(username = %identity.username, "user.logout");
            Json(json!({"logged_out": true})).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Notes ─────────────────────────────────────────────────────────────────────

pub async fn create_note(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(draft): Json<NoteDraft>,
) -> Response {
    let valid = match draft.validate(unix_now(), state.default_note_ttl_secs) {
        Ok(valid) => valid,
        Err(err) => return validation_error(&err),
    };

    match state.store.create(&identity.username, &valid) {
        Ok(note) => {
            info!(
                note_id = %note.id,
                owner = %note.owner,
                max_views = note.max_views,
                expires_at = ?note.expires_at,
                "note.create"
            );
            (StatusCode::CREATED, Json(NoteMeta::from(&note))).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn list_notes(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Response {
    match state.store.list_owned(&identity.username) {
        Ok(notes) => Json(json!({ "notes": notes })).into_response(),
        Err(e) => internal_error(e),
    }
}

/// A served note plus whether this read consumed it.
#[derive(Debug, Serialize, Deserialize)]
pub struct NoteResponse {
    pub id: String,
    pub title: String,
    pub content: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub current_views: u32,
    pub max_views: u32,
    pub consumed: bool,
}

impl NoteResponse {
    fn new(note: Note, consumed: bool) -> Self {
        Self {
            id: note.id,
            title: note.title,
            content: note.content,
            created_at: note.created_at,
            expires_at: note.expires_at,
            current_views: note.current_views,
            max_views: note.max_views,
            consumed,
        }
    }
}

pub async fn fetch_note(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.fetch_and_consume(&id) {
        Ok(FetchResult::Served(note)) => {
            info!(note_id = %note.id, views = note.current_views, "note.read");
            Json(NoteResponse::new(note, false)).into_response()
        }
        Ok(FetchResult::Consumed(note)) => {
            info!(note_id = %note.id, views = note.current_views, "note.consumed");
            Json(NoteResponse::new(note, true)).into_response()
        }
        Ok(FetchResult::Expired) => {
            info!(note_id = %id, "note.expired");
            gone()
        }
        Ok(FetchResult::NotFound) => gone(),
        Err(e) => internal_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn gone() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": GONE_MESSAGE }))).into_response()
}

fn validation_error(err: &ValidationError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": err.to_string(), "fields": err.fields})),
    )
        .into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
