//! Service-account credential source.
//!
//! Signs an RS256 JWT assertion with the account's private key and exchanges
//! it at the account's token endpoint (RFC 7523 bearer grant). The exchange is
//! a blocking HTTP call; `TokenProvider` runs it on the blocking pool.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::auth::token_provider::{AccessToken, AuthError, CredentialSource};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

pub struct ServiceAccountCredentials {
    client_email: String,
    token_uri: String,
    encoding_key: EncodingKey,
}

impl ServiceAccountCredentials {
    /// Parses a service-account JSON key file's contents.
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| AuthError::InvalidCredentials(format!("malformed key JSON: {e}")))?;

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| AuthError::InvalidCredentials(format!("unusable private key: {e}")))?;

        Ok(Self {
            client_email: key.client_email,
            token_uri: key.token_uri,
            encoding_key,
        })
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, AuthError> {
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }
}

impl CredentialSource for ServiceAccountCredentials {
    fn refresh(&self) -> Result<AccessToken, AuthError> {
        let now = Utc::now();
        let assertion = self.signed_assertion(now)?;

        // Built per refresh: the blocking client must not be dropped on an
        // async worker, and refreshes are rare.
        let client = reqwest::blocking::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let response = client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AuthError::Exchange(format!("status {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .map_err(|e| AuthError::Exchange(format!("unexpected token response: {e}")))?;

        Ok(AccessToken {
            token: token.access_token,
            expires_at: token
                .expires_in
                .map(|secs| now + chrono::Duration::seconds(secs)),
        })
    }
}
