//! Sliding-window rate limiter keyed by client identity.
//!
//! Each client owns the timestamps of its admitted requests within the trailing
//! 60 seconds. Old timestamps are purged lazily on that client's next check;
//! clients whose window has emptied are swept in batch every 100 checks.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Length of the sliding window.
pub const WINDOW: Duration = Duration::from_secs(60);
/// Fixed retry hint handed back on rejection.
pub const RETRY_AFTER_SECS: u64 = 60;
/// Stale clients are swept once per this many checks.
const SWEEP_EVERY: u64 = 100;

/// Header set by the trusted edge proxy (Cloudflare). Takes precedence.
pub const EDGE_CLIENT_IP_HEADER: &str = "cf-connecting-ip";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
pub struct RateLimited {
    pub retry_after_seconds: u64,
}

/// Per-client admission control. Constructed once at startup and shared
/// through `AppState`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    state: Mutex<WindowState>,
}

#[derive(Debug, Default)]
struct WindowState {
    windows: HashMap<String, VecDeque<Instant>>,
    checks: u64,
}

impl RateLimiter {
    /// `requests_per_minute` is clamped to at least 1.
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            limit: requests_per_minute.max(1) as usize,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admits or rejects one request from `client_id`, recording it if admitted.
    ///
    /// The whole read-modify-write happens under a single lock acquisition.
    pub fn check(&self, client_id: &str) -> Result<(), RateLimited> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.checks += 1;
        if state.checks % SWEEP_EVERY == 0 {
            let before = state.windows.len();
            state.windows.retain(|_, window| {
                purge_expired(window, now);
                !window.is_empty()
            });
            debug!(
                removed = before - state.windows.len(),
                remaining = state.windows.len(),
                "Swept stale rate-limit windows"
            );
        }

        let window = state.windows.entry(client_id.to_owned()).or_default();
        purge_expired(window, now);

        if window.len() >= self.limit {
            return Err(RateLimited {
                retry_after_seconds: RETRY_AFTER_SECS,
            });
        }

        window.push_back(now);
        Ok(())
    }

    /// Number of clients currently holding a window (including empty ones not
    /// yet swept).
    pub fn tracked_clients(&self) -> usize {
        self.state.lock().windows.len()
    }
}

fn purge_expired(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&oldest) = window.front() {
        if now.saturating_duration_since(oldest) >= WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Resolves the identity a request is rate-limited under.
///
/// Order: trusted edge header, first hop of `X-Forwarded-For`, transport peer
/// address, then a shared "unknown" bucket. The edge header wins because
/// forwarded-for is client-controlled when the proxy is bypassed.
pub fn resolve_client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(ip) = header_str(headers, EDGE_CLIENT_IP_HEADER) {
        return ip.to_string();
    }

    if let Some(first_hop) = header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first_hop.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_tenth_allowed_eleventh_rejected_within_window() {
        let limiter = RateLimiter::new(10);

        for i in 0..10 {
            assert!(limiter.check("A").is_ok(), "check {} should pass", i + 1);
            tokio::time::advance(Duration::from_millis(500)).await;
        }

        let rejected = limiter.check("A").unwrap_err();
        assert_eq!(rejected.retry_after_seconds, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_after_sixty_seconds() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.check("A").is_ok());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.check("A").is_ok());
        assert!(limiter.check("A").is_err());

        // First timestamp leaves the window; one slot frees up.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.check("A").is_ok());
        assert!(limiter.check("A").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_checks_are_not_recorded() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("A").is_ok());
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(10)).await;
            assert!(limiter.check("A").is_err());
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.check("A").is_ok());
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("A").is_ok());
        assert!(limiter.check("B").is_ok());
        assert!(limiter.check("A").is_err());
        assert!(limiter.check("B").is_err());
    }

    #[test]
    fn test_zero_limit_clamped_to_one() {
        let limiter = RateLimiter::new(0);
        assert_eq!(limiter.limit(), 1);
        assert!(limiter.check("A").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_drops_stale_clients() {
        let limiter = RateLimiter::new(1000);
        for i in 0..50 {
            limiter.check(&format!("one-shot-{i}")).unwrap();
        }
        assert_eq!(limiter.tracked_clients(), 50);

        tokio::time::advance(WINDOW + Duration::from_secs(1)).await;

        // Checks 51..=100 from a single client; the 100th triggers the sweep.
        for _ in 0..50 {
            limiter.check("steady").unwrap();
        }
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let limiter = Arc::new(RateLimiter::new(10));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.check("shared").is_ok() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_resolve_prefers_edge_header() {
        let mut headers = HeaderMap::new();
        headers.insert(EDGE_CLIENT_IP_HEADER, HeaderValue::from_static("203.0.113.7"));
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert_eq!(resolve_client_id(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_resolve_uses_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static(" 198.51.100.4 , 10.0.0.2"),
        );
        assert_eq!(resolve_client_id(&headers, None), "198.51.100.4");
    }

    #[test]
    fn test_resolve_falls_back_to_peer_then_unknown() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.10:443".parse().unwrap();
        assert_eq!(resolve_client_id(&headers, Some(peer)), "192.0.2.10");
        assert_eq!(resolve_client_id(&headers, None), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_resolve_ignores_blank_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(EDGE_CLIENT_IP_HEADER, HeaderValue::from_static("  "));
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static(""));
        assert_eq!(resolve_client_id(&headers, None), UNKNOWN_CLIENT);
    }
}
