use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::require_session,
    handlers::{create_note, fetch_note, health, list_notes, login, logout, register},
    ratelimit::{rate_limit, RateLimiter},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub cors_origins: Option<String>,
    /// Requests per client IP per hour on create, fetch, register and login.
    pub rate_limit_per_hour: u32,
    /// Key rate limits on `X-Forwarded-For` / `X-Real-IP` instead of the
    /// peer address. Off unless a reverse proxy sets those headers.
    pub trust_proxy: bool,
    pub session_ttl_secs: u64,
    pub default_note_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("VANISH_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("VANISH_PORT").unwrap_or(8080),
            data_dir: std::env::var("VANISH_DATA_DIR").ok().map(PathBuf::from),
            cors_origins: std::env::var("VANISH_CORS_ORIGINS").ok(),
            rate_limit_per_hour: env_parse("VANISH_RATE_LIMIT_PER_HOUR").unwrap_or(50),
            trust_proxy: env_parse("VANISH_TRUST_PROXY").unwrap_or(false),
            session_ttl_secs: env_parse("VANISH_SESSION_TTL_SECS").unwrap_or(14 * 86400),
            default_note_ttl_secs: env_parse("VANISH_DEFAULT_NOTE_TTL_SECS").unwrap_or(30 * 86400),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Resolve the data directory, creating it if needed.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    crate::dirs::data_dir(data_dir.map(PathBuf::as_path))
}

/// Build the application router around `state`.
///
/// Note creation passes the session check before the rate limiter, so
/// anonymous callers don't use up a client's budget.
pub fn build_router(state: AppState) -> Router {
    let limited = || middleware::from_fn_with_state(state.clone(), rate_limit);
    let session = || middleware::from_fn_with_state(state.clone(), require_session);

    // Public routes: the note id is the only capability needed to read.
    let public = Router::new()
        .route("/health", get(health))
        .merge(
            Router::new()
                .route("/notes/{id}", get(fetch_note))
                .route("/users/register", post(register))
                .route("/users/login", post(login))
                .route_layer(limited()),
        );

    // Authenticated routes.
    let protected = Router::new()
        .route("/notes", get(list_notes))
        .route("/users/logout", post(logout))
        .merge(
            Router::new()
                .route("/notes", post(create_note))
                .route_layer(limited()),
        )
        .route_layer(session());

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let enc_key = load_or_create_key(&data_dir)?;
    let db_path = data_dir.join("vanish.db");
    let store = crate::store::Store::open(&db_path, enc_key).context("open store")?;

    info!(
        per_hour = cfg.rate_limit_per_hour,
        trust_proxy = cfg.trust_proxy,
        "rate limiting create, fetch, register and login"
    );

    let state = AppState {
        store,
        limiter: RateLimiter::per_hour(cfg.rate_limit_per_hour).trust_forwarded(cfg.trust_proxy),
        session_ttl_secs: cfg.session_ttl_secs,
        default_note_ttl_secs: cfg.default_note_ttl_secs,
    };

    let app = build_router(state)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "vanish server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn load_or_create_key(data_dir: &std::path::Path) -> Result<crate::store::crypto::EncryptionKey> {
    let key_path = data_dir.join("vanish.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read vanish.key")?;
        crate::store::crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "vanish.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crate::store::crypto::generate_key();
        std::fs::write(&key_path, key.as_bytes()).context("write vanish.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
