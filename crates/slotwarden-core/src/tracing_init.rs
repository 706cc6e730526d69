//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"slotwarden_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialise tracing and, when an endpoint is given, the OTLP metrics
/// pipeline. The returned guard must be held for the process lifetime.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    init_tracing(default_filter, log_json);
    let endpoint = metrics_endpoint?;
    match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => {
            tracing::info!(endpoint, "OpenTelemetry metrics enabled");
            Some(guard)
        }
        Err(e) => {
            tracing::warn!(endpoint, error = %e, "Failed to initialise metrics pipeline");
            None
        }
    }
}

/// Initialise tracing. Metrics support is compiled out without the
/// `metrics` feature, so the endpoint is ignored.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(default_filter: &str, log_json: bool, _metrics_endpoint: Option<&str>) {
    init_tracing(default_filter, log_json);
}
