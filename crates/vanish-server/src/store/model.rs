use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

/// Longest accepted note title, in characters.
pub const MAX_TITLE_CHARS: usize = 100;

/// Stored in redb as bincode-encoded bytes.
/// `content_encrypted` is ChaCha20Poly1305 ciphertext over the note body.
/// Title and counters stay plaintext so listings never touch the cipher.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct NoteRecord {
    pub owner: String,
    pub title: String,
    /// ChaCha20Poly1305 ciphertext (content + tag).
    pub content_encrypted: Vec<u8>,
    /// Per-record random 12-byte nonce.
    pub nonce: [u8; 12],
    /// Unix timestamp (seconds) when the note was created.
    pub created_at: i64,
    /// Unix timestamp (seconds); the note is expired once this is in the past.
    pub expires_at: Option<i64>,
    pub current_views: u32,
    pub max_views: u32,
    /// Insertion sequence, allocated from the counters table.
    pub seq: u64,
}

impl NoteRecord {
    /// Returns true if this note has expired by time or by view count.
    pub fn is_expired(&self, now: i64) -> bool {
        if let Some(exp) = self.expires_at {
            if exp < now {
                return true;
            }
        }
        self.current_views >= self.max_views
    }

    pub(crate) fn meta(&self, id: &str) -> NoteMeta {
        NoteMeta {
            id: id.to_owned(),
            owner: self.owner.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            current_views: self.current_views,
            max_views: self.max_views,
            url: share_path(id),
        }
    }
}

/// Public metadata returned by listings. Never carries the note body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteMeta {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub current_views: u32,
    pub max_views: u32,
    /// Relative URL that serves the note; the id doubles as the access token.
    pub url: String,
}

/// A decrypted note as it was served by a fetch.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Note {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub content: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub current_views: u32,
    pub max_views: u32,
}

impl From<&Note> for NoteMeta {
    fn from(note: &Note) -> Self {
        Self {
            id: note.id.clone(),
            owner: note.owner.clone(),
            title: note.title.clone(),
            created_at: note.created_at,
            expires_at: note.expires_at,
            current_views: note.current_views,
            max_views: note.max_views,
            url: share_path(&note.id),
        }
    }
}

pub fn share_path(id: &str) -> String {
    format!("/notes/{id}")
}

// ── Creation input ───────────────────────────────────────────────────────────

/// Unvalidated note creation input, as submitted by a client.
/// Missing fields deserialize to their defaults so that validation, not the
/// JSON extractor, reports them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NoteDraft {
    pub title: String,
    pub content: String,
    /// Absolute expiry (Unix seconds). Mutually exclusive with `ttl_seconds`.
    pub expires_at: Option<i64>,
    /// Relative expiry from now.
    pub ttl_seconds: Option<u64>,
    pub max_views: Option<u32>,
}

/// Field-level validation failures for a [`NoteDraft`].
#[derive(Debug, Clone, Default, PartialEq, Error)]
#[error("validation failed")]
pub struct ValidationError {
    pub fields: BTreeMap<&'static str, Vec<String>>,
}

impl ValidationError {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.entry(field).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }
}

/// A draft that passed validation, with defaults resolved.
/// `Store::create` only accepts this type.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidNote {
    pub(crate) title: String,
    pub(crate) content: String,
    pub(crate) expires_at: Option<i64>,
    pub(crate) max_views: u32,
}

impl NoteDraft {
    /// Validate the draft against `now`, filling in the default lifetime
    /// (`default_ttl_secs`) and the default view limit of 1.
    pub fn validate(self, now: i64, default_ttl_secs: u64) -> Result<ValidNote, ValidationError> {
        let mut err = ValidationError::default();

        let title = self.title.trim().to_owned();
        if title.is_empty() {
            err.add("title", "this field is required");
        } else if title.chars().count() > MAX_TITLE_CHARS {
            err.add(
                "title",
                format!("ensure this value has at most {MAX_TITLE_CHARS} characters"),
            );
        }

        if self.content.trim().is_empty() {
            err.add("content", "this field is required");
        }

        let max_views = self.max_views.unwrap_or(1);
        if max_views == 0 {
            err.add("max_views", "must be at least 1");
        }

        let expires_at = match (self.expires_at, self.ttl_seconds) {
            (Some(_), Some(_)) => {
                err.add("expires_at", "give either expires_at or ttl_seconds, not both");
                None
            }
            (Some(at), None) => Some(at),
            (None, Some(ttl)) => Some(offset(now, ttl)),
            (None, None) => Some(offset(now, default_ttl_secs)),
        };

        if !err.is_empty() {
            return Err(err);
        }

        Ok(ValidNote {
            title,
            content: self.content,
            expires_at,
            max_views,
        })
    }
}

fn offset(now: i64, secs: u64) -> i64 {
    now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))
}
