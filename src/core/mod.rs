//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling and redaction
//! - Logging context and metrics
//! - HTTP middleware
//! - Admission control and the bounded response cache

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod redact;

// Re-export commonly used types
pub use cache::{BoundedCache, CacheError, CacheOptions, CacheStats, ResponseCache};
pub use cancel::StreamCancelHandle;
pub use config::AppConfig;
pub use error::{AppError, Result};
pub use logging::{get_request_id, init_tracing, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware};
pub use rate_limiter::RateLimiter;
pub use redact::redact_sensitive;
