use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: handled API calls. Labels: operation, status.
pub const REQUESTS_TOTAL: &str = "bookline_requests_total";

/// Histogram: handling latency in seconds. Labels: operation.
pub const REQUEST_DURATION_SECONDS: &str = "bookline_request_duration_seconds";

/// Counter: booking attempts rejected for overlapping an existing booking.
pub const CONFLICTS_TOTAL: &str = "bookline_conflicts_total";

/// Counter: rejected by the per-address rate limit.
pub const RATE_LIMITED_TOTAL: &str = "bookline_rate_limited_total";

// ── Degraded operation ──────────────────────────────────────────

/// Counter: operations served by the fallback store. Labels: operation.
pub const FALLBACK_ACTIVATIONS_TOTAL: &str = "bookline_fallback_activations_total";

/// Counter: recurring occurrences by outcome. Labels: outcome (created, skipped, failed).
pub const SERIES_OCCURRENCES_TOTAL: &str = "bookline_series_occurrences_total";

/// Counter: post-commit effects that failed. Labels: effect.
pub const EFFECT_FAILURES_TOTAL: &str = "bookline_effect_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: tenants with an open ledger in the primary store.
pub const TENANTS_ACTIVE: &str = "bookline_tenants_active";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
