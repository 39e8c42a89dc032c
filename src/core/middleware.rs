//! HTTP middleware for request ids and request metrics.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Header carrying the request id in both directions.
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Longest caller-supplied request id that is echoed back.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Extension type for storing the serving provider in the response
#[derive(Clone, Debug)]
pub struct ProviderName(pub String);

/// Extension type for storing the served model in the response
#[derive(Clone, Debug)]
pub struct ModelName(pub String);

/// Accept a caller-supplied id only if it is short and printable.
fn incoming_request_id(request: &Request) -> Option<String> {
    let value = request.headers().get(&REQUEST_ID_HEADER)?.to_str().ok()?;
    let valid = !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    valid.then(|| value.to_string())
}

/// Attach a request id to the task-local logging context and the response.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = incoming_request_id(&request).unwrap_or_else(generate_request_id);

    let mut response = REQUEST_ID
        .scope(request_id.clone(), async move { next.run(request).await })
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), value);
    }
    response
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Track active requests, duration and status for every route except
    /// `/metrics` itself.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let endpoint = request.uri().path().to_string();
        let method = request.method().to_string();

        if endpoint == "/metrics" {
            return next.run(request).await;
        }

        let metrics = get_metrics();
        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .inc();

        let start = Instant::now();
        let response = next.run(request).await;
        let duration = start.elapsed().as_secs_f64();
        let status_code = response.status().as_u16().to_string();

        let provider = response
            .extensions()
            .get::<ProviderName>()
            .map(|p| p.0.as_str())
            .unwrap_or("none");
        let model = response
            .extensions()
            .get::<ModelName>()
            .map(|m| m.0.as_str())
            .unwrap_or("none");

        metrics
            .request_count
            .with_label_values(&[&method, &endpoint, provider, &status_code])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[&method, &endpoint, provider])
            .observe(duration);

        // For SSE responses this is time to first byte, not the stream length
        let is_streaming = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);

        tracing::info!(
            method = %method,
            endpoint = %endpoint,
            status = %status_code,
            provider = %provider,
            model = %model,
            streaming = is_streaming,
            duration_ms = (duration * 1000.0) as u64,
            "Request finished"
        );

        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .dec();

        response
    }
}
