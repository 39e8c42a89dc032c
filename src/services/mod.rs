//! Upstream-facing services.
//!
//! Provider HTTP clients, the retry executor, the circuit breaker and the
//! manager that orders provider and model fallback on top of them.

pub mod circuit_breaker;
pub mod provider_client;
pub mod provider_manager;
pub mod retry;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use provider_client::{create_http_client, read_payload, ProviderClient, ProviderRequest};
pub use provider_manager::{ProviderCall, ProviderManager, ProviderResponse};
pub use retry::{RetryExecutor, RetryOptions};
