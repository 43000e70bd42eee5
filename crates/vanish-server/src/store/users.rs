use std::sync::OnceLock;

use anyhow::{Context, Result};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::db::unix_now;
use super::model::ValidationError;

pub(crate) const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
pub(crate) const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

pub const MAX_USERNAME_CHARS: usize = 150;
pub const MIN_PASSWORD_CHARS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Argon2id hash in PHC string format.
    pub password_hash: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub username: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("username is already taken")]
    UsernameTaken,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Generate a new session token in the format `vanish_sess_<32 hex chars>`.
pub fn generate_session_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    format!("vanish_sess_{}", hex::encode(bytes))
}

/// Hash a session token with SHA-256 for storage lookup.
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password_hash: &str, password: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Hash checked when the username is unknown, so a failed login costs one
/// Argon2 verification either way.
fn placeholder_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password("vanish-placeholder").unwrap_or_default())
}

/// Check a username/password pair against the account rules.
pub fn validate_credentials(username: &str, password: &str) -> Result<(), ValidationError> {
    let mut err = ValidationError::default();

    if username.is_empty() {
        err.add("username", "this field is required");
    } else if username.chars().count() > MAX_USERNAME_CHARS {
        err.add(
            "username",
            format!("ensure this value has at most {MAX_USERNAME_CHARS} characters"),
        );
    } else if !username
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '@' | '.' | '+' | '-' | '_'))
    {
        err.add(
            "username",
            "may contain only letters, numbers, and @/./+/-/_ characters",
        );
    }

    if password.chars().count() < MIN_PASSWORD_CHARS {
        err.add(
            "password",
            format!("this password is too short; it must contain at least {MIN_PASSWORD_CHARS} characters"),
        );
    }
    if !password.is_empty() && password.chars().all(|c| c.is_ascii_digit()) {
        err.add("password", "this password is entirely numeric");
    }
    if !username.is_empty() && password.eq_ignore_ascii_case(username) {
        err.add("password", "the password is too similar to the username");
    }

    if err.is_empty() {
        Ok(())
    } else {
        Err(err)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).context("bincode encode")
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(value)
}

impl super::db::Store {
    /// Create an account. The uniqueness check and the insert share one
    /// write transaction.
    pub fn register_user(&self, username: &str, password: &str) -> Result<UserRecord, RegisterError> {
        validate_credentials(username, password)?;

        let record = UserRecord {
            username: username.to_owned(),
            password_hash: hash_password(password)?,
            created_at: unix_now(),
        };
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write().map_err(anyhow::Error::from)?;
        {
            let mut table = write_txn.open_table(USERS).map_err(anyhow::Error::from)?;
            if table
                .get(username)
                .map_err(anyhow::Error::from)?
                .is_some()
            {
                return Err(RegisterError::UsernameTaken);
            }
            table
                .insert(username, bytes.as_slice())
                .map_err(anyhow::Error::from)?;
        }
        write_txn.commit().map_err(anyhow::Error::from)?;

        debug!(username = %username, "registered user");
        Ok(record)
    }

    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        let raw: Option<Vec<u8>> = table.get(username)?.map(|g| g.value().to_vec());
        raw.as_deref().map(decode::<UserRecord>).transpose()
    }

    /// Returns the user if `password` matches. Unknown users and wrong
    /// passwords are indistinguishable to the caller.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Option<UserRecord>> {
        match self.get_user(username)? {
            Some(user) if verify_password(&user.password_hash, password) => Ok(Some(user)),
            Some(_) => Ok(None),
            None => {
                verify_password(placeholder_hash(), password);
                Ok(None)
            }
        }
    }

    /// Start a session for `username` lasting `ttl_secs`. Returns the raw
    /// token; only its hash is stored.
    pub fn open_session(&self, username: &str, ttl_secs: u64) -> Result<String> {
        let token = generate_session_token();
        let now = unix_now();
        let record = SessionRecord {
            username: username.to_owned(),
            created_at: now,
            expires_at: now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX)),
        };
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS)?;
            table.insert(hash_token(&token).as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(token)
    }

    /// Map a raw token to its username. Expired sessions are deleted and
    /// resolve to `None`.
    pub fn resolve_session(&self, token: &str) -> Result<Option<String>> {
        self.resolve_session_at(token, unix_now())
    }

    pub(crate) fn resolve_session_at(&self, token: &str, now: i64) -> Result<Option<String>> {
        let hash = hash_token(token);

        let session: Option<SessionRecord> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS)?;
            let raw: Option<Vec<u8>> = table.get(hash.as_str())?.map(|g| g.value().to_vec());
            raw.as_deref().map(decode::<SessionRecord>).transpose()?
        };

        match session {
            None => Ok(None),
            Some(s) if s.expires_at <= now => {
                self.remove_session(&hash)?;
                debug!(username = %s.username, "dropped expired session");
                Ok(None)
            }
            Some(s) => Ok(Some(s.username)),
        }
    }

    /// End a session. Returns true if it existed.
    pub fn close_session(&self, token: &str) -> Result<bool> {
        self.remove_session(&hash_token(token))
    }

    fn remove_session(&self, hash: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = write_txn.open_table(SESSIONS)?.remove(hash)?.is_some();
        write_txn.commit()?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{crypto, Store};
    use tempfile::tempdir;

    fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db"), crypto::generate_key()).unwrap();
        (store, dir)
    }

    #[test]
    fn token_format() {
        let t = generate_session_token();
        assert!(t.starts_with("vanish_sess_"));
        assert_eq!(t.len(), "vanish_sess_".len() + 32);
        assert_ne!(t, generate_session_token());
        assert_eq!(hash_token(&t), hash_token(&t));
        assert_eq!(hash_token(&t).len(), 64);
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(&hash, "correct horse"));
        assert!(!verify_password(&hash, "wrong horse"));
        assert!(!verify_password("not a phc string", "correct horse"));
    }

    #[test]
    fn unknown_user_still_runs_argon2() {
        let hash = placeholder_hash();
        assert!(hash.starts_with("$argon2id$"));
        assert!(PasswordHash::new(hash).is_ok());
        assert!(!verify_password(hash, "s3cret-pass"));

        let (s, _dir) = make_store();
        // Even the placeholder's own password never logs anyone in.
        assert!(s.authenticate("nobody", "vanish-placeholder").unwrap().is_none());
    }

    #[test]
    fn credential_rules() {
        assert!(validate_credentials("alice", "s3cret-pass").is_ok());
        assert!(validate_credentials("a.b+c-d_e@x", "s3cret-pass").is_ok());

        let err = validate_credentials("", "s3cret-pass").unwrap_err();
        assert!(err.has("username"));

        let err = validate_credentials("bad name!", "s3cret-pass").unwrap_err();
        assert!(err.has("username"));

        let err = validate_credentials(&"u".repeat(MAX_USERNAME_CHARS + 1), "s3cret-pass").unwrap_err();
        assert!(err.has("username"));

        for weak in ["short", "12345678901", "Alice-Long"] {
            let name = if weak == "Alice-Long" { "alice-long" } else { "alice" };
            let err = validate_credentials(name, weak).unwrap_err();
            assert!(err.has("password"), "{weak} should be rejected");
            assert!(!err.has("username"));
        }
    }

    #[test]
    fn register_and_authenticate() {
        let (s, _dir) = make_store();
        let user = s.register_user("alice", "s3cret-pass").unwrap();
        assert_eq!(user.username, "alice");

        assert!(s.authenticate("alice", "s3cret-pass").unwrap().is_some());
        assert!(s.authenticate("alice", "nope-nope").unwrap().is_none());
        assert!(s.authenticate("bob", "s3cret-pass").unwrap().is_none());
    }

    #[test]
    fn duplicate_username_rejected() {
        let (s, _dir) = make_store();
        s.register_user("alice", "s3cret-pass").unwrap();
        assert!(matches!(
            s.register_user("alice", "another-pass"),
            Err(RegisterError::UsernameTaken)
        ));
        // The registered password still works.
        assert!(s.authenticate("alice", "s3cret-pass").unwrap().is_some());
    }

    #[test]
    fn invalid_registration_stores_nothing() {
        let (s, _dir) = make_store();
        assert!(matches!(
            s.register_user("alice", "short"),
            Err(RegisterError::Invalid(_))
        ));
        assert!(s.get_user("alice").unwrap().is_none());
    }

    #[test]
    fn session_lifecycle() {
        let (s, _dir) = make_store();
        let token = s.open_session("alice", 3600).unwrap();
        assert_eq!(s.resolve_session(&token).unwrap().as_deref(), Some("alice"));
        assert!(s.resolve_session("vanish_sess_bogus").unwrap().is_none());

        assert!(s.close_session(&token).unwrap());
        assert!(!s.close_session(&token).unwrap());
        assert!(s.resolve_session(&token).unwrap().is_none());
    }

    #[test]
    fn expired_session_is_dropped() {
        let (s, _dir) = make_store();
        let token = s.open_session("alice", 60).unwrap();
        let later = unix_now() + 61;
        assert!(s.resolve_session_at(&token, later).unwrap().is_none());
        // Deleted, so even "now" no longer resolves it.
        assert!(s.resolve_session(&token).unwrap().is_none());
        assert!(!s.close_session(&token).unwrap());
    }
}
