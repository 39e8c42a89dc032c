//! HTTP clients for the primary and fallback providers.
//!
//! Both providers speak the OpenAI chat completions wire format; they differ
//! in endpoint layout and in which model identifiers they serve. Error
//! responses are classified into a small fixed set and their bodies never
//! leave this module except as redacted debug logs.

use crate::api::models::{Message, ProviderKind, ProviderPayload};
use crate::core::config::{FallbackProviderConfig, PrimaryProviderConfig};
use crate::core::error::{AppError, Result};
use crate::core::logging::get_request_id;
use crate::core::metrics::get_metrics;
use crate::core::redact::redact_sensitive;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Primary-provider identifiers carry this prefix.
pub const PRIMARY_MODEL_PREFIX: &str = "@cf/";

/// Which provider serves a given model identifier.
pub fn model_owner(model: &str) -> ProviderKind {
    if model.starts_with(PRIMARY_MODEL_PREFIX) {
        ProviderKind::Primary
    } else {
        ProviderKind::Fallback
    }
}

/// One outbound chat completion call.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub stream: bool,
    pub temperature: Option<f64>,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

impl<'a> From<&ProviderRequest<'a>> for ChatBody<'a> {
    fn from(request: &ProviderRequest<'a>) -> Self {
        Self {
            model: request.model,
            messages: request.messages,
            stream: request.stream,
            temperature: request.temperature,
        }
    }
}

/// Create HTTP client with connection pooling
pub fn create_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(AppError::from)
}

pub struct ProviderClient {
    kind: ProviderKind,
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
    timeout: Duration,
    debug: bool,
}

impl ProviderClient {
    pub fn primary(
        config: &PrimaryProviderConfig,
        http: reqwest::Client,
        timeout: Duration,
        debug: bool,
    ) -> Self {
        Self {
            kind: ProviderKind::Primary,
            endpoint: format!(
                "{}/accounts/{}/ai/v1/chat/completions",
                config.api_base.trim_end_matches('/'),
                config.account_id
            ),
            api_key: config.api_key.clone(),
            http,
            timeout,
            debug,
        }
    }

    pub fn fallback(
        config: &FallbackProviderConfig,
        http: reqwest::Client,
        timeout: Duration,
        debug: bool,
    ) -> Self {
        Self {
            kind: ProviderKind::Fallback,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            http,
            timeout,
            debug,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one chat completion request. Returns the response once a 2xx
    /// status line has arrived; the body is left unread.
    pub async fn send(&self, request: &ProviderRequest<'_>) -> Result<reqwest::Response> {
        let metrics = get_metrics();
        let provider = self.kind.as_str();
        let start = Instant::now();

        let outbound = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&ChatBody::from(request))
            .send();

        let response = match tokio::time::timeout(self.timeout, outbound).await {
            Err(_) => {
                metrics
                    .upstream_requests
                    .with_label_values(&[provider, "timeout"])
                    .inc();
                return Err(AppError::Timeout(format!(
                    "{} request timed out after {}ms",
                    provider,
                    self.timeout.as_millis()
                )));
            }
            Ok(Err(e)) if e.is_timeout() => {
                metrics
                    .upstream_requests
                    .with_label_values(&[provider, "timeout"])
                    .inc();
                return Err(AppError::Timeout(format!("{} request timed out", provider)));
            }
            Ok(Err(e)) => {
                metrics
                    .upstream_requests
                    .with_label_values(&[provider, "network_error"])
                    .inc();
                return Err(AppError::Unavailable(format!(
                    "{} transport error: {}",
                    provider,
                    redact_sensitive(&e.to_string())
                )));
            }
            Ok(Ok(response)) => response,
        };

        metrics
            .upstream_latency
            .with_label_values(&[provider])
            .observe(start.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            return Err(self.handle_error(request.model, response).await);
        }

        metrics
            .upstream_requests
            .with_label_values(&[provider, "success"])
            .inc();
        tracing::debug!(
            request_id = %get_request_id(),
            provider = %provider,
            model = %request.model,
            status = status.as_u16(),
            "Upstream accepted request"
        );
        Ok(response)
    }

    /// Read the error body once, log it redacted, and classify the status.
    async fn handle_error(&self, model: &str, response: reqwest::Response) -> AppError {
        let status = response.status();
        let error = classify_status(self.kind, status);
        let outcome = match &error {
            AppError::Unauthorized => "unauthorized",
            AppError::RateLimitExceeded(_) => "rate_limited",
            _ => "unavailable",
        };
        get_metrics()
            .upstream_requests
            .with_label_values(&[self.kind.as_str(), outcome])
            .inc();

        let body = match tokio::time::timeout(self.timeout, response.text()).await {
            Ok(Ok(text)) => redact_sensitive(&text),
            _ => String::new(),
        };

        if self.debug {
            tracing::warn!(
                request_id = %get_request_id(),
                provider = %self.kind,
                model = %model,
                status = status.as_u16(),
                body = %body,
                "Upstream error response"
            );
        } else {
            tracing::debug!(
                request_id = %get_request_id(),
                provider = %self.kind,
                model = %model,
                status = status.as_u16(),
                "Upstream error response"
            );
        }

        error
    }
}

/// 401/403 are credential failures, 429 is upstream throttling, everything
/// else is unavailability.
pub fn classify_status(kind: ProviderKind, status: StatusCode) -> AppError {
    match status.as_u16() {
        401 | 403 => AppError::Unauthorized,
        429 => AppError::RateLimitExceeded(format!("{} returned 429", kind)),
        code => AppError::Unavailable(format!("{} returned {}", kind, code)),
    }
}

/// Read a non-streaming body within `timeout`.
pub async fn read_payload(response: reqwest::Response, timeout: Duration) -> Result<ProviderPayload> {
    match tokio::time::timeout(timeout, response.bytes()).await {
        Err(_) => Err(AppError::Timeout(format!(
            "response body not received within {}ms",
            timeout.as_millis()
        ))),
        Ok(Err(e)) => Err(AppError::Unavailable(format!(
            "failed to read response body: {}",
            redact_sensitive(&e.to_string())
        ))),
        Ok(Ok(bytes)) => serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Unavailable(format!("invalid JSON from provider: {}", e))),
    }
}
