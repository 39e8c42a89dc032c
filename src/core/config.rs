//! Configuration management for the gateway.
//!
//! Configuration is read once at construction. Sources are layered, later
//! ones winning: built-in defaults, an optional config file, `GATEWAY__*`
//! environment variables, and finally a handful of well-known variables
//! (`PRIMARY_API_KEY`, `PORT`, ...).

use crate::api::models::ProviderKind;
use crate::api::validation::is_allowed_model;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Primary provider credentials (required)
    #[serde(default)]
    pub primary: PrimaryProviderConfig,

    /// Fallback provider credentials (optional)
    #[serde(default)]
    pub fallback: Option<FallbackProviderConfig>,

    /// Model used when a request names none
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Whether requests that omit `stream` are streamed
    #[serde(default = "default_stream")]
    pub default_stream: bool,

    /// Provider used when a request names none
    #[serde(default)]
    pub provider_preference: ProviderKind,

    /// Attempts made by the retry executor around a provider call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Enables debug logging of redacted upstream error bodies
    #[serde(default)]
    pub debug: bool,

    /// Timeout in seconds for each outbound provider call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Credentials and endpoint for the primary provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryProviderConfig {
    #[serde(default = "default_primary_api_base")]
    pub api_base: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub account_id: String,
}

impl Default for PrimaryProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_primary_api_base(),
            api_key: String::new(),
            account_id: String::new(),
        }
    }
}

/// Credentials, endpoint and default model for the fallback provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackProviderConfig {
    #[serde(default = "default_fallback_api_base")]
    pub api_base: String,

    pub api_key: String,

    #[serde(default = "default_fallback_model")]
    pub model: String,
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Maximum number of entries; the byte bound is `max_size * 1024`
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    #[serde(default = "default_cache_ttl_ms")]
    pub default_ttl_ms: u64,

    #[serde(default = "default_cache_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Pending mutations beyond this are rejected
    #[serde(default = "default_cache_max_pending")]
    pub max_pending_ops: usize,

    #[serde(default = "default_cache_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_cache_max_size(),
            default_ttl_ms: default_cache_ttl_ms(),
            cleanup_interval_secs: default_cache_cleanup_interval(),
            max_pending_ops: default_cache_max_pending(),
            op_timeout_ms: default_cache_op_timeout_ms(),
        }
    }
}

/// Per-client admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            max_clients: default_max_clients(),
        }
    }
}

/// Streaming bounds. Must satisfy read < inactivity <= total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_total_ms")]
    pub total_timeout_ms: u64,

    #[serde(default = "default_stream_inactivity_ms")]
    pub inactivity_timeout_ms: u64,

    #[serde(default = "default_stream_read_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            total_timeout_ms: default_stream_total_ms(),
            inactivity_timeout_ms: default_stream_inactivity_ms(),
            read_timeout_ms: default_stream_read_ms(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            primary: PrimaryProviderConfig::default(),
            fallback: None,
            default_model: default_model(),
            default_stream: default_stream(),
            provider_preference: ProviderKind::default(),
            max_retries: default_max_retries(),
            debug: false,
            request_timeout_secs: default_request_timeout(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            stream: StreamConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_primary_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_fallback_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_fallback_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_model() -> String {
    "@cf/meta/llama-3.1-8b-instruct".to_string()
}

fn default_stream() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_cache_max_size() -> usize {
    500
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

fn default_cache_cleanup_interval() -> u64 {
    600
}

fn default_cache_max_pending() -> usize {
    1000
}

fn default_cache_op_timeout_ms() -> u64 {
    5_000
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_clients() -> usize {
    10_000
}

fn default_stream_total_ms() -> u64 {
    60_000
}

fn default_stream_inactivity_ms() -> u64 {
    30_000
}

fn default_stream_read_ms() -> u64 {
    10_000
}

fn default_max_chunk_size() -> usize {
    8192
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment,
    /// then validate it.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_fallback_gateway::core::config::AppConfig;
    ///
    /// let config = AppConfig::load(Some("gateway.yaml")).expect("Failed to load config");
    /// ```
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let mut config: AppConfig = builder
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.apply_env_overrides();
        config.validate()?;
        config.warn_on_placeholder_credentials();

        Ok(config)
    }

    /// Well-known environment variables take precedence over everything else.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }

        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(key) = std::env::var("PRIMARY_API_KEY") {
            self.primary.api_key = key;
        }

        if let Ok(account) = std::env::var("PRIMARY_ACCOUNT_ID") {
            self.primary.account_id = account;
        }

        if let Ok(base) = std::env::var("PRIMARY_API_BASE") {
            self.primary.api_base = base;
        }

        if let Ok(key) = std::env::var("FALLBACK_API_KEY") {
            if key.is_empty() {
                self.fallback = None;
            } else {
                let fallback = self.fallback.get_or_insert_with(|| FallbackProviderConfig {
                    api_base: default_fallback_api_base(),
                    api_key: String::new(),
                    model: default_fallback_model(),
                });
                fallback.api_key = key;
            }
        }

        if let Some(fallback) = self.fallback.as_mut() {
            if let Ok(base) = std::env::var("FALLBACK_API_BASE") {
                fallback.api_base = base;
            }
            if let Ok(model) = std::env::var("FALLBACK_MODEL") {
                fallback.model = model;
            }
        }

        if let Ok(provider) = std::env::var("GATEWAY_PROVIDER") {
            if let Some(kind) = ProviderKind::parse(&provider) {
                self.provider_preference = kind;
            } else {
                tracing::warn!(value = %provider, "Ignoring unknown GATEWAY_PROVIDER");
            }
        }

        if let Ok(debug) = std::env::var("DEBUG") {
            self.debug = str_to_bool(&debug);
        }
    }

    /// Construction-time gate. Missing primary credentials are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.primary.api_key.trim().is_empty() {
            bail!("Primary provider API key is required (set PRIMARY_API_KEY)");
        }
        if self.primary.account_id.trim().is_empty() {
            bail!("Primary provider account id is required (set PRIMARY_ACCOUNT_ID)");
        }
        if !is_allowed_model(&self.default_model) {
            bail!("Default model '{}' is not in the allowed models list", self.default_model);
        }
        if let Some(fallback) = &self.fallback {
            if fallback.api_key.trim().is_empty() {
                bail!("Fallback provider is configured without an API key");
            }
            if !is_allowed_model(&fallback.model) {
                bail!("Fallback model '{}' is not in the allowed models list", fallback.model);
            }
        }
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        if self.rate_limit.window_ms == 0 || self.rate_limit.max_clients == 0 {
            bail!("rate_limit.window_ms and rate_limit.max_clients must be positive");
        }
        let stream = &self.stream;
        if stream.max_chunk_size == 0 {
            bail!("stream.max_chunk_size must be positive");
        }
        if stream.read_timeout_ms == 0 {
            bail!("stream.read_timeout_ms must be positive");
        }
        if !(stream.read_timeout_ms < stream.inactivity_timeout_ms
            && stream.inactivity_timeout_ms <= stream.total_timeout_ms)
        {
            bail!(
                "stream timeouts must satisfy read ({}ms) < inactivity ({}ms) <= total ({}ms)",
                stream.read_timeout_ms,
                stream.inactivity_timeout_ms,
                stream.total_timeout_ms
            );
        }
        Ok(())
    }

    /// Placeholder-looking credentials only warrant a warning.
    fn warn_on_placeholder_credentials(&self) {
        if looks_like_placeholder(&self.primary.api_key, 20) {
            tracing::warn!("PRIMARY_API_KEY appears to be a placeholder value");
        }
        if looks_like_placeholder(&self.primary.account_id, 32) {
            tracing::warn!("PRIMARY_ACCOUNT_ID appears to be a placeholder value");
        }
        if let Some(fallback) = &self.fallback {
            if looks_like_placeholder(&fallback.api_key, 20) {
                tracing::warn!("FALLBACK_API_KEY appears to be a placeholder value");
            }
        }
    }

    /// Providers that can serve traffic with this configuration.
    pub fn available_providers(&self) -> Vec<ProviderKind> {
        let mut providers = vec![ProviderKind::Primary];
        if self.fallback.is_some() {
            providers.push(ProviderKind::Fallback);
        }
        providers
    }
}

fn looks_like_placeholder(value: &str, min_len: usize) -> bool {
    let lower = value.to_lowercase();
    lower.contains("your-") || lower.contains("placeholder") || value.len() < min_len
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::Builder;

    const ENV_VARS: &[&str] = &[
        "HOST",
        "PORT",
        "PRIMARY_API_KEY",
        "PRIMARY_ACCOUNT_ID",
        "PRIMARY_API_BASE",
        "FALLBACK_API_KEY",
        "FALLBACK_API_BASE",
        "FALLBACK_MODEL",
        "GATEWAY_PROVIDER",
        "DEBUG",
        "GATEWAY__CACHE__ENABLED",
        "GATEWAY__RATE_LIMIT__MAX_REQUESTS",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    fn valid_config() -> AppConfig {
        AppConfig {
            primary: PrimaryProviderConfig {
                api_base: "http://localhost:9000".to_string(),
                api_key: "primary-key-0123456789abcdef".to_string(),
                account_id: "0123456789abcdef0123456789abcdef".to_string(),
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_str_to_bool() {
        assert!(str_to_bool("true"));
        assert!(str_to_bool("TRUE"));
        assert!(str_to_bool("1"));
        assert!(str_to_bool("yes"));
        assert!(str_to_bool("On"));
        assert!(!str_to_bool("false"));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool(""));
        assert!(!str_to_bool("invalid"));
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.default_model, "@cf/meta/llama-3.1-8b-instruct");
        assert!(config.default_stream);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.max_size, 500);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.stream.max_chunk_size, 8192);
        assert_eq!(config.provider_preference, ProviderKind::Primary);
    }

    #[test]
    fn test_validate_requires_primary_credentials() {
        let config = AppConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("PRIMARY_API_KEY"));

        let mut config = valid_config();
        config.primary.account_id.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unlisted_default_model() {
        let mut config = valid_config();
        config.default_model = "@cf/unknown/model".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unlisted_fallback_model() {
        let mut config = valid_config();
        config.fallback = Some(FallbackProviderConfig {
            api_base: default_fallback_api_base(),
            api_key: "sk-fallback".to_string(),
            model: "gpt-99".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_misordered_stream_timeouts() {
        let mut config = valid_config();
        config.stream.read_timeout_ms = 40_000;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.stream.inactivity_timeout_ms = 90_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_read_timeout() {
        let mut config = valid_config();
        config.stream.read_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("read_timeout_ms"));
    }

    #[test]
    fn test_available_providers() {
        let mut config = valid_config();
        assert_eq!(config.available_providers(), vec![ProviderKind::Primary]);

        config.fallback = Some(FallbackProviderConfig {
            api_base: default_fallback_api_base(),
            api_key: "sk-fallback".to_string(),
            model: default_fallback_model(),
        });
        assert_eq!(
            config.available_providers(),
            vec![ProviderKind::Primary, ProviderKind::Fallback]
        );
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(looks_like_placeholder("your-api-token-here-xxxxx", 20));
        assert!(looks_like_placeholder("short", 20));
        assert!(!looks_like_placeholder("a-real-looking-token-0123456789", 20));
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        clear_env();
        std::env::set_var("PRIMARY_API_KEY", "env-primary-key-0123456789");
        std::env::set_var("PRIMARY_ACCOUNT_ID", "0123456789abcdef0123456789abcdef");
        std::env::set_var("FALLBACK_API_KEY", "sk-env-fallback-0123456789");
        std::env::set_var("GATEWAY_PROVIDER", "fallback");
        std::env::set_var("PORT", "9999");
        std::env::set_var("GATEWAY__CACHE__ENABLED", "true");
        std::env::set_var("GATEWAY__RATE_LIMIT__MAX_REQUESTS", "7");

        let config = AppConfig::load(None).unwrap();

        assert_eq!(config.primary.api_key, "env-primary-key-0123456789");
        assert_eq!(config.server.port, 9999);
        assert!(config.cache.enabled);
        assert_eq!(config.rate_limit.max_requests, 7);
        assert_eq!(config.provider_preference, ProviderKind::Fallback);
        let fallback = config.fallback.unwrap();
        assert_eq!(fallback.api_key, "sk-env-fallback-0123456789");
        assert_eq!(fallback.model, "gpt-4o-mini");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_missing_credentials_fails() {
        clear_env();
        let result = AppConfig::load(None);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file_with_env_override() {
        clear_env();
        let mut temp_file = Builder::new().suffix(".yaml").tempfile().unwrap();
        let config_content = r#"
server:
  host: 127.0.0.1
  port: 8080
primary:
  api_base: http://localhost:9000
  api_key: file-primary-key-0123456789
  account_id: 0123456789abcdef0123456789abcdef
default_stream: false
max_retries: 2
cache:
  enabled: true
  max_size: 10
"#;
        temp_file.write_all(config_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        std::env::set_var("HOST", "192.168.1.1");

        let path = temp_file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();

        assert_eq!(config.server.host, "192.168.1.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.primary.api_key, "file-primary-key-0123456789");
        assert!(!config.default_stream);
        assert_eq!(config.max_retries, 2);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_size, 10);
        assert!(config.fallback.is_none());

        clear_env();
    }
}
