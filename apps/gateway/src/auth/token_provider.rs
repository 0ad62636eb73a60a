//! Credential selection for upstream calls.
//!
//! Two modes, fixed at construction:
//! - **Dynamic**: exchanges a signing credential for short-lived bearer tokens,
//!   reusing the cached token until it is within 5 minutes of expiry.
//! - **Static**: sends a fixed API key and never refreshes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::resilience::timeout::run_with_timeout;

/// Header carrying the static API key.
pub const API_KEY_HEADER: &str = "x-goog-api-key";
/// Refresh once the cached token is this close to expiry.
const REFRESH_BUFFER_SECS: i64 = 300;
/// Assumed lifetime when the provider does not report one (55 minutes).
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 55 * 60;
const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid service account credentials: {0}")]
    InvalidCredentials(String),

    #[error("Failed to sign token assertion: {0}")]
    Signing(String),

    #[error("Token exchange failed: {0}")]
    Exchange(String),
}

/// A freshly minted token as reported by the credential source.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    /// `None` when the source does not report an expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Supplies short-lived bearer tokens.
///
/// `refresh` is allowed to block; callers run it on the blocking pool.
pub trait CredentialSource: Send + Sync + 'static {
    fn refresh(&self) -> Result<AccessToken, AuthError>;
}

/// Cached bearer token. Replaced wholesale on refresh.
#[derive(Debug, Clone)]
struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - chrono::Duration::seconds(REFRESH_BUFFER_SECS)
    }
}

enum AuthMode {
    Dynamic {
        source: Arc<dyn CredentialSource>,
        cached: Mutex<Option<Credential>>,
        refresh_timeout: Duration,
    },
    Static {
        api_key: String,
    },
}

pub struct TokenProvider {
    mode: AuthMode,
}

impl TokenProvider {
    pub fn dynamic(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            mode: AuthMode::Dynamic {
                source,
                cached: Mutex::new(None),
                refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            },
        }
    }

    pub fn static_key(api_key: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Static {
                api_key: api_key.into(),
            },
        }
    }

    /// Bounds how long a single refresh may take before it is abandoned.
    /// No effect in static mode.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        if let AuthMode::Dynamic {
            refresh_timeout, ..
        } = &mut self.mode
        {
            *refresh_timeout = timeout;
        }
        self
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.mode, AuthMode::Dynamic { .. })
    }

    /// Returns a usable bearer token, refreshing if the cached one is missing
    /// or near expiry. `None` in static mode or when refresh fails.
    pub async fn access_token(&self) -> Option<String> {
        let AuthMode::Dynamic {
            source,
            cached,
            refresh_timeout,
        } = &self.mode
        else {
            return None;
        };

        // Held across the refresh so concurrent callers share one exchange.
        let mut cached = cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if credential.is_fresh(Utc::now()) {
                return Some(credential.token.clone());
            }
        }

        let source = source.clone();
        let refreshed = run_with_timeout("auth.refresh", *refresh_timeout, None, async move {
            tokio::task::spawn_blocking(move || source.refresh())
                .await
                .map_err(|e| AuthError::Exchange(format!("refresh task failed: {e}")))?
                .map(Some)
        })
        .await;

        let Some(fresh) = refreshed else {
            error!("Failed to refresh upstream access token");
            return None;
        };

        let expires_at = fresh
            .expires_at
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));
        debug!(%expires_at, "Upstream access token refreshed");

        *cached = Some(Credential {
            token: fresh.token.clone(),
            expires_at,
        });
        Some(fresh.token)
    }

    /// Authorization headers for the current mode. Empty when a dynamic
    /// refresh failed; callers treat that as a terminal auth failure.
    pub async fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        match &self.mode {
            AuthMode::Static { api_key } => match HeaderValue::from_str(api_key) {
                Ok(value) => {
                    headers.insert(API_KEY_HEADER, value);
                }
                Err(_) => {
                    error!("Static API key is not a valid header value");
                    return headers;
                }
            },
            AuthMode::Dynamic { .. } => {
                let Some(token) = self.access_token().await else {
                    return headers;
                };
                match HeaderValue::from_str(&format!("Bearer {token}")) {
                    Ok(value) => {
                        headers.insert(AUTHORIZATION, value);
                    }
                    Err(_) => {
                        error!("Access token is not a valid header value");
                        return headers;
                    }
                }
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }
}
