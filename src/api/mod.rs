//! API layer for the gateway.
//!
//! This module contains the HTTP handlers, request/response models, input
//! validation and streaming support, plus the router that wires them to the
//! middleware stack.

pub mod disconnect;
pub mod handlers;
pub mod models;
pub mod streaming;
pub mod validation;

use crate::core::middleware::{request_id_middleware, MetricsMiddleware};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

// Re-export commonly used types
pub use handlers::{chat_completions, health, metrics_handler, AppState, HealthResponse};
pub use models::{ChatCompletionResponse, ChatRequest, Message, ProviderKind, StreamChunk};
pub use streaming::{sse_response, transform, DeltaEvent, StreamError, StreamOptions};
pub use validation::validate_request_body;

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/chat", post(chat_completions))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(MetricsMiddleware::track_metrics))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
