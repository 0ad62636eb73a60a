pub mod admission;
pub mod health;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::chat::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    // Admission control covers every route registered above the route_layer.
    let api = Router::new()
        .route("/session", post(handlers::handle_create_session))
        .route("/chat", post(handlers::handle_chat))
        .route("/chat/stream", post(handlers::handle_chat_stream))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission::rate_limit,
        ))
        .route("/health", get(health::health_handler));

    Router::new()
        .route("/health", get(health::health_handler))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
