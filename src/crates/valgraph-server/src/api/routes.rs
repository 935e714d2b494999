//! API route definitions.

use crate::api::handlers;
use crate::engine::Engine;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the complete API router
pub fn create_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/stream", post(handlers::stream))
        .route(
            "/threads/:id",
            get(handlers::get_thread).delete(handlers::delete_thread),
        )
        .route("/threads/:id/history", get(handlers::get_history))
        .route("/threads/:id/cancel", post(handlers::cancel_thread))
        .route("/threads/:id/state", post(handlers::update_thread_state))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}
