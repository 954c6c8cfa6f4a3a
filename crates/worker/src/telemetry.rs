// Logging setup for the worker binary
//
// Console output through tracing-subscriber, filtered by RUST_LOG or LOG_LEVEL.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Log filter (e.g., "info", "bucketd_daemon=debug")
    pub log_filter: Option<String>,
    /// Include the event target in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "bucketd-worker".to_string(),
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// - `SERVICE_NAME`: Service name (default: "bucketd-worker")
    /// - `RUST_LOG`: Full filter directive
    /// - `LOG_LEVEL`: Level applied to the bucketd crates when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "bucketd-worker".to_string()),
            log_filter: std::env::var("RUST_LOG").ok().or_else(|| {
                std::env::var("LOG_LEVEL")
                    .ok()
                    .map(|level| format!("bucketd_daemon={level},bucketd_worker={level}"))
            }),
            with_target: true,
        }
    }
}

/// Install the global subscriber
///
/// Unparseable filters fall back to `bucketd_daemon=info,bucketd_worker=info`.
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("bucketd_daemon=info,bucketd_worker=info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(filter);

    tracing_subscriber::registry().with(console_layer).init();

    tracing::debug!(service = %config.service_name, "Logging initialized");
}
