pub mod auth;
pub mod dirs;
pub mod handlers;
pub mod ratelimit;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    /// Per-IP limiter for note creation, note fetch, register and login.
    pub limiter: ratelimit::RateLimiter,
    /// Lifetime of a login session, in seconds.
    pub session_ttl_secs: u64,
    /// Lifetime applied to notes created without an explicit expiry.
    pub default_note_ttl_secs: u64,
}

pub use server::{build_router, resolve_data_dir, run, ServerConfig};
