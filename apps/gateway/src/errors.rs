use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::turnstile::CaptchaError;
use crate::resilience::rate_limiter::RateLimited;

/// Request-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
///
/// Upstream, auth and store failures never reach here: they degrade to
/// fallback content inside their components. Besides bad input, only a
/// rejected CAPTCHA and rate limiting are surfaced to the client.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },
}

impl From<CaptchaError> for AppError {
    fn from(e: CaptchaError) -> Self {
        AppError::Forbidden(e.to_string())
    }
}

impl From<RateLimited> for AppError {
    fn from(e: RateLimited) -> Self {
        AppError::RateLimited {
            retry_after_seconds: e.retry_after_seconds,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            AppError::RateLimited { retry_after_seconds } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                format!("Too many requests. Please retry in {retry_after_seconds} seconds."),
            ),
        };

        let mut error = json!({
            "code": code,
            "message": message
        });
        if let AppError::RateLimited { retry_after_seconds } = &self {
            error["retry_after_seconds"] = json!(retry_after_seconds);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();
        if let AppError::RateLimited { retry_after_seconds } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_seconds));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_maps_to_429_with_retry_after() {
        let response = AppError::from(RateLimited {
            retry_after_seconds: 60,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
        assert_eq!(body["error"]["retry_after_seconds"], 60);
    }

    #[tokio::test]
    async fn test_validation_maps_to_400() {
        let response = AppError::Validation("Query cannot be empty".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["message"], "Query cannot be empty");
    }

    #[tokio::test]
    async fn test_captcha_failure_maps_to_403() {
        let response = AppError::from(CaptchaError::Missing).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "FORBIDDEN");
        assert_eq!(body["error"]["message"], "CAPTCHA verification required");
    }
}
