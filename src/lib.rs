//! LLM Fallback Gateway - one chat-completion endpoint in front of two providers
//!
//! This library provides the request pipeline of a gateway that serves every
//! call from a primary inference provider and falls back to a secondary one:
//!
//! - **Validation**: bounded, sanitized requests checked against a model allowlist
//! - **Rate Limiting**: per-client fixed windows with fail-closed admission
//! - **Response Cache**: bounded LRU + TTL cache for non-streaming completions
//! - **Provider Fallback**: ordered model fallback, retries with jitter, circuit breaking
//! - **Streaming**: upstream SSE normalised into one canonical chunk format
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, errors, logging, metrics, middleware,
//!   rate limiter, cache)
//! - [`api`]: HTTP handlers, request/response models, validation, streaming
//! - [`services`]: Provider clients, retry, circuit breaker, provider manager
//!
//! # Configuration
//!
//! The server requires the following environment variables:
//! - `PRIMARY_API_KEY`: Primary provider API token
//! - `PRIMARY_ACCOUNT_ID`: Primary provider account id
//!
//! Optional environment variables:
//! - `FALLBACK_API_KEY`: Enables the fallback provider
//! - `HOST`: Server bind address (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3000)
//! - `GATEWAY_CONFIG`: Path to a configuration file
//! - `DEBUG`: Verbose logging of redacted upstream errors

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{router, AppState, ChatCompletionResponse, ChatRequest};
pub use core::{AppConfig, AppError, Result};
pub use services::ProviderManager;
