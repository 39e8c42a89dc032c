//! Provider selection and model fallback.
//!
//! The primary path walks an ordered list of models and stops at the first
//! success. Credential failures end the walk immediately. When every primary
//! model fails for any other reason and a fallback provider is configured,
//! its default model gets one attempt. The whole chain runs under the retry
//! executor.

use crate::api::models::{Message, ProviderKind};
use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::core::logging::get_request_id;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::services::provider_client::{model_owner, ProviderClient, ProviderRequest};
use crate::services::retry::{RetryExecutor, RetryOptions};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Broadly available primary models tried after the requested one.
pub const PRIMARY_FALLBACK_MODELS: &[&str] = &[
    "@cf/meta/llama-3.1-8b-instruct",
    "@cf/meta/llama-3.1-70b-instruct",
    "@cf/openchat/openchat-3.5-0106",
];

/// A validated chat call as seen by the provider layer.
#[derive(Debug, Clone, Copy)]
pub struct ProviderCall<'a> {
    pub messages: &'a [Message],
    pub model: &'a str,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub provider: Option<ProviderKind>,
}

/// A 2xx upstream response together with who actually served it.
#[derive(Debug)]
pub struct ProviderResponse {
    pub response: reqwest::Response,
    pub provider: ProviderKind,
    pub model: String,
}

struct Upstream {
    client: ProviderClient,
    breaker: Option<CircuitBreaker>,
    default_model: String,
}

impl Upstream {
    async fn send(&self, call: &ProviderCall<'_>, model: &str) -> Result<ProviderResponse> {
        let request = ProviderRequest {
            model,
            messages: call.messages,
            stream: call.stream,
            temperature: call.temperature,
        };
        let response = match &self.breaker {
            Some(breaker) => breaker.call(|| self.client.send(&request)).await?,
            None => self.client.send(&request).await?,
        };
        Ok(ProviderResponse {
            response,
            provider: self.client.kind(),
            model: model.to_string(),
        })
    }
}

pub struct ProviderManager {
    primary: Upstream,
    fallback: Option<Upstream>,
    preference: ProviderKind,
    retry: RetryExecutor,
    timeout: Duration,
}

impl ProviderManager {
    pub fn new(config: &AppConfig, http: reqwest::Client) -> Self {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let breaker = |kind: ProviderKind| {
            config
                .circuit_breaker
                .enabled
                .then(|| CircuitBreaker::from_config(kind.as_str(), &config.circuit_breaker))
        };

        let primary = Upstream {
            client: ProviderClient::primary(&config.primary, http.clone(), timeout, config.debug),
            breaker: breaker(ProviderKind::Primary),
            default_model: config.default_model.clone(),
        };
        let fallback = config.fallback.as_ref().map(|fallback| Upstream {
            client: ProviderClient::fallback(fallback, http.clone(), timeout, config.debug),
            breaker: breaker(ProviderKind::Fallback),
            default_model: fallback.model.clone(),
        });

        Self {
            primary,
            fallback,
            preference: config.provider_preference,
            retry: RetryExecutor::with_max_attempts(config.max_retries),
            timeout,
        }
    }

    /// Override backoff timing. Attempt count is kept from the configuration.
    #[must_use]
    pub fn with_retry_options(mut self, options: RetryOptions) -> Self {
        self.retry = RetryExecutor::new(RetryOptions {
            max_attempts: self.retry.options().max_attempts,
            ..options
        });
        self
    }

    /// Per-call upstream timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn available_providers(&self) -> Vec<ProviderKind> {
        let mut providers = vec![ProviderKind::Primary];
        if self.fallback.is_some() {
            providers.push(ProviderKind::Fallback);
        }
        providers
    }

    pub fn is_provider_available(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Primary => true,
            ProviderKind::Fallback => self.fallback.is_some(),
        }
    }

    /// Breaker state per provider; empty when breakers are disabled.
    pub fn circuit_states(&self) -> Vec<(ProviderKind, CircuitState)> {
        std::iter::once(&self.primary)
            .chain(self.fallback.as_ref())
            .filter_map(|upstream| {
                upstream
                    .breaker
                    .as_ref()
                    .map(|breaker| (upstream.client.kind(), breaker.state()))
            })
            .collect()
    }

    /// Ordered primary models: the requested one when the primary serves it,
    /// else the configured default, then the fixed list without repeats.
    pub fn primary_candidates(&self, requested: &str) -> Vec<String> {
        let first = if model_owner(requested) == ProviderKind::Primary {
            requested
        } else {
            self.primary.default_model.as_str()
        };

        let mut candidates = vec![first.to_string()];
        for model in PRIMARY_FALLBACK_MODELS {
            if !candidates.iter().any(|c| c == model) {
                candidates.push((*model).to_string());
            }
        }
        candidates
    }

    /// Run the call under the retry policy.
    pub async fn call(&self, call: &ProviderCall<'_>) -> Result<ProviderResponse> {
        self.retry.execute(|| self.attempt(call)).await
    }

    async fn attempt(&self, call: &ProviderCall<'_>) -> Result<ProviderResponse> {
        let provider = call.provider.unwrap_or(self.preference);

        if provider == ProviderKind::Fallback {
            match &self.fallback {
                Some(fallback) => {
                    let model = if model_owner(call.model) == ProviderKind::Fallback {
                        call.model
                    } else {
                        fallback.default_model.as_str()
                    };
                    return fallback.send(call, model).await;
                }
                None => {
                    debug!(
                        request_id = %get_request_id(),
                        "Fallback provider requested but not configured, using primary"
                    );
                }
            }
        }

        let mut last_error = None;
        for model in self.primary_candidates(call.model) {
            match self.primary.send(call, &model).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_auth() => {
                    warn!(
                        request_id = %get_request_id(),
                        model = %model,
                        "Primary provider rejected credentials, aborting fallback chain"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        request_id = %get_request_id(),
                        model = %model,
                        error = %e,
                        "Primary model failed, trying next candidate"
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(fallback) = &self.fallback {
            info!(
                request_id = %get_request_id(),
                model = %fallback.default_model,
                "Primary provider exhausted, switching to fallback provider"
            );
            return fallback.send(call, &fallback.default_model).await;
        }

        Err(last_error.unwrap_or_else(|| AppError::Internal("no primary model candidates".to_string())))
    }
}
