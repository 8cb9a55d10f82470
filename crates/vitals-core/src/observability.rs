//! Observability infrastructure for vitals.
//!
//! Structured logging with consistent spans. Request-scoped work runs inside
//! [`request_span`]; batch jobs run inside [`job_span`].

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `vitals_stats=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // A subscriber installed by the host process wins.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates a span for a request-scoped operation.
#[must_use]
pub fn request_span(operation: &str, origin: &str, request_id: &str) -> Span {
    tracing::info_span!(
        "request",
        op = operation,
        origin = origin,
        request_id = request_id,
    )
}

/// Creates a span for a batch job run.
#[must_use]
pub fn job_span(job: &str, run_id: &str) -> Span {
    tracing::info_span!("job", job = job, run_id = run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = request_span("ingest", "hook", "req-1");
        let _guard = span.enter();
        tracing::info!("inside request span");

        let span = job_span("reconcile", "run-1");
        let _guard = span.enter();
        tracing::info!("inside job span");
    }
}
