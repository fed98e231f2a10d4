//! Shared tracing/logging initialization.
//!
//! The `stackd` binary and the integration harnesses use the same pattern for
//! setting up `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor `--log-level` say otherwise.
pub const DEFAULT_FILTER: &str = "stackd_daemon=info,stackd_proxy=info,stackd_core=info";

/// Build the default filter directive for a given level.
///
/// `info` maps to `stackd_daemon=info,stackd_proxy=info,stackd_core=info`.
pub fn filter_for_level(level: &str) -> String {
    ["stackd_daemon", "stackd_proxy", "stackd_core"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. [`DEFAULT_FILTER`]).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialise tracing and, when an endpoint is given, the OTLP pipeline.
///
/// Spans are exported through a `tracing-opentelemetry` layer. The returned
/// guard must be kept alive for the process lifetime.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    use opentelemetry::trace::TracerProvider as _;

    let guard = match endpoint.map(crate::metrics::init_metrics) {
        Some(Ok(guard)) => Some(guard),
        Some(Err(e)) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, "OTLP pipeline unavailable, continuing without metrics");
            return None;
        }
        None => None,
    };

    // The OTel layer sits directly on the filtered registry so both fmt
    // variants stack on the same subscriber type.
    let otel_layer = guard.as_ref().map(|g| {
        tracing_opentelemetry::layer().with_tracer(g.tracer_provider().tracer("stackd"))
    });
    let base = tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(otel_layer);

    if log_json {
        base.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        base.with(tracing_subscriber::fmt::layer()).init();
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_for_level_covers_all_crates() {
        assert_eq!(filter_for_level("info"), DEFAULT_FILTER);
        assert!(filter_for_level("debug").contains("stackd_proxy=debug"));
    }

    // The only test in this crate that installs the global subscriber.
    #[cfg(feature = "metrics")]
    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn otel_layer_installs_with_plain_output() {
        let guard =
            init_tracing_with_metrics(DEFAULT_FILTER, false, Some("http://localhost:4317"))
                .unwrap();
        let span = tracing::info_span!("startup", service = "db");
        span.in_scope(|| tracing::info!("inside exported span"));
        drop(span);
        // No collector is listening; a failed final flush is expected.
        let _ = guard.shutdown();
    }
}
