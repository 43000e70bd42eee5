//! Per-client-IP fixed-window request limiting.
//!
//! Windows live in process memory. A client gets `limit` requests per
//! `window`; the window starts at its first request. Clients are keyed on
//! the peer address unless the limiter is told it sits behind a trusted
//! proxy, in which case `X-Forwarded-For` / `X-Real-IP` are honoured.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::AppState;

/// Most clients tracked at once. A new client arriving at a full map evicts
/// the oldest window.
const MAX_CLIENTS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    hits: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    /// Rejected; the window reopens after this long.
    Deny { retry_after: Duration },
}

#[derive(Clone)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    max_clients: usize,
    trust_forwarded: bool,
    clients: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            max_clients: MAX_CLIENTS,
            trust_forwarded: false,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `limit` requests per hour.
    pub fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(3600))
    }

    /// Key clients on forwarding headers. Only enable behind a reverse proxy
    /// that overwrites them.
    pub fn trust_forwarded(mut self, trust: bool) -> Self {
        self.trust_forwarded = trust;
        self
    }

    /// Cap on tracked clients (default 10,000).
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients.max(1);
        self
    }

    /// Key for the caller behind `addr`.
    pub fn client_key(&self, headers: &HeaderMap, addr: &SocketAddr) -> String {
        if self.trust_forwarded {
            extract_ip(headers, addr)
        } else {
            addr.ip().to_string()
        }
    }

    pub fn check(&self, client: &str) -> Decision {
        self.check_at(client, Instant::now())
    }

    pub(crate) fn check_at(&self, client: &str, now: Instant) -> Decision {
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !clients.contains_key(client) && clients.len() >= self.max_clients {
            let window = self.window;
            clients.retain(|_, w| now.duration_since(w.started) < window);
            if clients.len() >= self.max_clients {
                let oldest = clients
                    .iter()
                    .min_by_key(|(_, w)| w.started)
                    .map(|(k, _)| k.clone());
                if let Some(key) = oldest {
                    clients.remove(&key);
                }
            }
        }

        let entry = clients.entry(client.to_owned()).or_insert(Window {
            started: now,
            hits: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                hits: 0,
            };
        }

        if entry.hits >= self.limit {
            let elapsed = now.duration_since(entry.started);
            return Decision::Deny {
                retry_after: self.window.saturating_sub(elapsed),
            };
        }
        entry.hits += 1;
        Decision::Allow
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Client IP as reported by a proxy: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the peer address.
pub fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

/// Axum middleware that rejects clients over their request budget with 429.
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = state.limiter.client_key(request.headers(), &addr);
    match state.limiter.check(&ip) {
        Decision::Allow => next.run(request).await,
        Decision::Deny { retry_after } => {
            warn!(ip = %ip, path = %request.uri().path(), "rate limit exceeded");
            let secs = retry_after.as_secs().max(1);
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "rate limit exceeded"})),
            )
                .into_response();
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit() {
        let rl = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        for _ in 0..3 {
            assert_eq!(rl.check_at("1.2.3.4", t0), Decision::Allow);
        }
        assert!(matches!(
            rl.check_at("1.2.3.4", t0 + Duration::from_secs(10)),
            Decision::Deny { retry_after } if retry_after == Duration::from_secs(50)
        ));
    }

    #[test]
    fn clients_are_isolated() {
        let rl = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert_eq!(rl.check_at("a", t0), Decision::Allow);
        assert!(matches!(rl.check_at("a", t0), Decision::Deny { .. }));
        assert_eq!(rl.check_at("b", t0), Decision::Allow);
    }

    #[test]
    fn window_resets() {
        let rl = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert_eq!(rl.check_at("a", t0), Decision::Allow);
        assert!(matches!(rl.check_at("a", t0 + Duration::from_secs(59)), Decision::Deny { .. }));
        assert_eq!(rl.check_at("a", t0 + Duration::from_secs(60)), Decision::Allow);
    }

    #[test]
    fn per_hour_default() {
        let rl = RateLimiter::per_hour(50);
        let t0 = Instant::now();
        for _ in 0..50 {
            assert_eq!(rl.check_at("ip", t0), Decision::Allow);
        }
        assert!(matches!(rl.check_at("ip", t0), Decision::Deny { .. }));
    }

    #[test]
    fn full_map_evicts_oldest_window() {
        let rl = RateLimiter::new(1, Duration::from_secs(60)).with_max_clients(2);
        let t0 = Instant::now();
        assert_eq!(rl.check_at("a", t0), Decision::Allow);
        assert_eq!(rl.check_at("b", t0 + Duration::from_secs(1)), Decision::Allow);
        assert_eq!(rl.check_at("c", t0 + Duration::from_secs(2)), Decision::Allow);
        assert_eq!(rl.tracked(), 2);

        // "b" kept its window; "a" was evicted and starts over.
        assert!(matches!(rl.check_at("b", t0 + Duration::from_secs(3)), Decision::Deny { .. }));
        assert_eq!(rl.check_at("a", t0 + Duration::from_secs(3)), Decision::Allow);
        assert_eq!(rl.tracked(), 2);
    }

    #[test]
    fn peer_address_is_the_key_by_default() {
        let addr: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        headers.insert("x-real-ip", HeaderValue::from_static("192.168.1.1"));

        let direct = RateLimiter::per_hour(1);
        assert_eq!(direct.client_key(&headers, &addr), "10.0.0.9");

        let proxied = RateLimiter::per_hour(1).trust_forwarded(true);
        assert_eq!(proxied.client_key(&headers, &addr), "203.0.113.7");
    }

    #[test]
    fn ip_extraction_order() {
        let addr: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(extract_ip(&headers, &addr), "10.0.0.9");

        headers.insert("x-real-ip", HeaderValue::from_static(" 192.168.1.1 "));
        assert_eq!(extract_ip(&headers, &addr), "192.168.1.1");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(extract_ip(&headers, &addr), "203.0.113.7");
    }
}
