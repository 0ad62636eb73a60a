use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::errors::AppError;
use crate::resilience::rate_limiter::resolve_client_id;
use crate::state::AppState;

/// Identity a request is rate-limited under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Absent when the server was not started with connect info (router tests).
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientId(resolve_client_id(&parts.headers, peer)))
    }
}

/// Sliding-window admission for the chat and session routes.
pub async fn rate_limit(
    State(state): State<AppState>,
    ClientId(client_id): ClientId,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Err(limited) = state.rate_limiter.check(&client_id) {
        warn!(
            client_id = %client_id,
            path = %request.uri().path(),
            limit = state.rate_limiter.limit(),
            "Rate limit exceeded"
        );
        return Err(limited.into());
    }
    Ok(next.run(request).await)
}
