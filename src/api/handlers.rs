//! HTTP request handlers for the gateway API.
//!
//! `chat_completions` is the composition root of the request pipeline:
//! admission control, validation, cache lookup, the provider call and either
//! the SSE transform or the JSON transform plus cache store. Errors from the
//! inner stages surface here once and are rendered by [`AppError`].

use crate::api::models::{ChatCompletionResponse, ProviderKind};
use crate::api::streaming::{sse_response, StreamOptions};
use crate::api::validation::validate_request_body;
use crate::core::cache::{response_cache_key, CacheOptions, CacheStats, ResponseCache};
use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::core::logging::get_request_id;
use crate::core::metrics::render;
use crate::core::middleware::{ModelName, ProviderName};
use crate::core::rate_limiter::{client_id_from_request, RateLimitStatus, RateLimiter};
use crate::services::provider_client::{create_http_client, read_payload};
use crate::services::provider_manager::{ProviderCall, ProviderManager};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shared application state, owned by the router for the process lifetime.
pub struct AppState {
    pub config: AppConfig,
    pub limiter: Arc<RateLimiter>,
    /// `None` when response caching is disabled
    pub cache: Option<Arc<ResponseCache>>,
    pub manager: ProviderManager,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let http = create_http_client()?;
        let manager = ProviderManager::new(&config, http);
        Ok(Self::with_manager(config, manager))
    }

    /// Build state around an existing provider manager.
    pub fn with_manager(config: AppConfig, manager: ProviderManager) -> Self {
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(CacheOptions::from_config(&config.cache))));

        Self {
            config,
            limiter,
            cache,
            manager,
        }
    }

    /// Start the rate limiter sweeper and the cache cleanup timer.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.limiter.spawn_sweeper()];
        if let Some(cache) = &self.cache {
            tasks.push(cache.spawn_cleanup());
        }
        tasks
    }

    /// Drain the rate limiter within `budget` and destroy the cache.
    pub async fn shutdown(&self, budget: Duration) {
        let drained = self.limiter.shutdown(budget).await;
        if let Some(cache) = &self.cache {
            cache.destroy().await;
        }
        tracing::info!(rate_limit_records = drained, "Application state released");
    }
}

/// 429 with `X-RateLimit-*` and `Retry-After` headers.
fn rate_limited_response(status: &RateLimitStatus) -> Response {
    let retry_after = (status.reset_at - chrono::Utc::now()).num_seconds().max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "Rate limit exceeded" })),
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(status.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(status.remaining));
    if let Ok(reset) = HeaderValue::from_str(&status.reset_at.to_rfc3339()) {
        headers.insert("x-ratelimit-reset", reset);
    }
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn tag_response(mut response: Response, provider: &str, model: &str) -> Response {
    response
        .extensions_mut()
        .insert(ProviderName(provider.to_string()));
    response.extensions_mut().insert(ModelName(model.to_string()));
    response
}

/// Handle chat completion requests.
///
/// Supports both streaming and non-streaming responses; only the latter are
/// cached.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let client_id = client_id_from_request(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    if !state.limiter.check_limit(&client_id) {
        // Capacity and invalid-id rejections leave no record behind
        let status = RateLimitStatus {
            remaining: 0,
            ..state.limiter.get_status(&client_id)
        };
        tracing::info!(
            request_id = %get_request_id(),
            client = %client_id,
            "Rate limit exceeded"
        );
        return Ok(rate_limited_response(&status));
    }

    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::validation(format!("Request body is not valid JSON: {}", e)))?;
    let request = validate_request_body(&value)?;

    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.default_model.clone());
    let stream = request.stream.unwrap_or(state.config.default_stream);

    tracing::info!(
        request_id = %get_request_id(),
        model = %model,
        stream,
        messages = request.messages.len(),
        provider = ?request.provider,
        "Chat completion request"
    );

    let call = ProviderCall {
        messages: &request.messages,
        model: &model,
        stream,
        temperature: request.temperature,
        provider: request.provider,
    };

    if stream {
        let served = state.manager.call(&call).await?;
        let response = sse_response(
            served.response,
            &served.model,
            served.provider,
            StreamOptions::from(&state.config.stream),
        );
        return Ok(tag_response(response, served.provider.as_str(), &served.model));
    }

    let cache_key = response_cache_key(&request.messages, &model, request.temperature);
    if let Some(cache) = &state.cache {
        if let Some(mut hit) = cache.get(&cache_key) {
            tracing::debug!(request_id = %get_request_id(), "Serving cached response");
            hit.cached = Some(true);
            let served_model = hit.model.clone();
            return Ok(tag_response(Json(hit).into_response(), "cache", &served_model));
        }
    }

    let served = state.manager.call(&call).await?;
    let payload = read_payload(served.response, state.manager.timeout()).await?;
    let completion = ChatCompletionResponse::from_provider(payload, &served.model);

    if let Some(cache) = &state.cache {
        if let Err(e) = cache.set(&cache_key, completion.clone(), None).await {
            tracing::warn!(
                request_id = %get_request_id(),
                error = %e,
                "Cache store failed, continuing without caching"
            );
        }
    }

    Ok(tag_response(
        Json(completion).into_response(),
        served.provider.as_str(),
        &served.model,
    ))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub providers: Vec<ProviderKind>,
    pub default_model: String,
    pub cache: Option<CacheStats>,
    /// Breaker state per provider, omitted when breakers are disabled
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub circuits: BTreeMap<String, String>,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    tracing::debug!(request_id = %get_request_id(), "Health check requested");

    Json(HealthResponse {
        status: "ok".to_string(),
        providers: state.manager.available_providers(),
        default_model: state.config.default_model.clone(),
        cache: state.cache.as_ref().map(|cache| cache.get_stats()),
        circuits: state
            .manager
            .circuit_states()
            .into_iter()
            .map(|(kind, circuit)| (kind.to_string(), circuit.as_str().to_string()))
            .collect(),
    })
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(),
    )
        .into_response()
}
