//! Logging setup and request-scoped logging context.
//!
//! The request id is carried in a task-local so any log line inside a request
//! can include it without threading it through every call.

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Build the filter string, always appending noise suppression for the HTTP
/// stack so a bare `RUST_LOG=trace` does not flood the output.
fn filter_directives(base: Option<String>, debug: bool) -> String {
    let base = base.unwrap_or_else(|| {
        if debug {
            "info,llm_fallback_gateway=debug".to_string()
        } else {
            "info".to_string()
        }
    });
    format!("{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn", base)
}

/// Install the global tracing subscriber.
///
/// `LOG_FORMAT=json` switches to JSON lines; `NO_COLOR` disables ANSI codes.
/// Calling this twice is harmless; the second install is ignored.
pub fn init_tracing(debug: bool) {
    let filter = EnvFilter::new(filter_directives(std::env::var("RUST_LOG").ok(), debug));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let no_color = std::env::var("NO_COLOR").is_ok();

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_timer(LocalTime))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
