//! LLM Fallback Gateway - Main entry point
//!
//! This binary loads configuration, builds the request pipeline and serves it
//! until SIGINT/SIGTERM, then releases the rate limiter and cache.

use anyhow::Result;
use llm_fallback_gateway::{
    api::{router, AppState},
    core::{init_metrics, init_tracing, AppConfig},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Time allowed for draining in-memory state after the server stops.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    // Detect optimal worker threads from environment or cgroup
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .or_else(detect_cpu_limit)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let config_path = std::env::var("GATEWAY_CONFIG").ok();
    let debug_hint = std::env::var("DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(false);
    init_tracing(debug_hint);

    init_metrics();

    let config = AppConfig::load(config_path.as_deref())?;
    let bind = (config.server.host.clone(), config.server.port);

    tracing::info!(
        providers = ?config.available_providers(),
        default_model = %config.default_model,
        preference = %config.provider_preference,
        cache_enabled = config.cache.enabled,
        circuit_breaker = config.circuit_breaker.enabled,
        "Configuration loaded"
    );

    let state = Arc::new(AppState::new(config)?);
    let background = state.spawn_background_tasks();
    let app = router(state.clone());

    tracing::info!("Starting LLM Fallback Gateway on {}:{}", bind.0, bind.1);
    tracing::info!("Chat API: /v1/chat/completions, /api/chat");
    tracing::info!("Health endpoint: /health");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped, releasing state");
    state.shutdown(SHUTDOWN_BUDGET).await;
    for task in background {
        task.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Parse a cgroup quota/period pair into whole cores.
fn cores_from_quota(quota: i64, period: i64) -> Option<usize> {
    (quota > 0 && period > 0).then(|| ((quota as f64 / period as f64).ceil() as usize).max(1))
}

fn detect_cpu_limit() -> Option<usize> {
    // cgroup v2
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let mut parts = max.split_whitespace();
        if let (Some(quota), Some(period)) = (parts.next(), parts.next()) {
            if let (Ok(quota), Ok(period)) = (quota.parse::<i64>(), period.parse::<i64>()) {
                if let Some(cores) = cores_from_quota(quota, period) {
                    println!("Detected CPU limit from cgroup v2: {} cores", cores);
                    return Some(cores);
                }
            }
        }
    }

    // cgroup v1
    let read = |path: &str| -> Option<i64> { std::fs::read_to_string(path).ok()?.trim().parse().ok() };
    let quota = read("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?;
    let period = read("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?;
    let cores = cores_from_quota(quota, period)?;
    println!("Detected CPU limit from cgroup v1: {} cores", cores);
    Some(cores)
}
