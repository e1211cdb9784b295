use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::warn;

use super::state::AppState;

/// Global metrics registry
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// All application metrics
pub struct Metrics {
    // Reads
    pub config_reads: IntCounterVec,

    // Writes
    pub version_appends: IntCounterVec,
    pub releases_total: IntCounterVec,

    // Gray resolution
    pub gray_resolutions: IntCounterVec,

    // Long polling
    pub long_polls_active: IntGauge,
    pub long_poll_outcomes: IntCounterVec,

    // Notification hub
    pub hub_publishes: IntCounterVec,
    pub hub_dropped: IntCounter,

    // Access control
    pub auth_failures: IntCounterVec,

    // Storage metrics
    pub storage_backend: IntGaugeVec,
    pub storage_write_duration: HistogramVec,

    // HTTP request metrics
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn new(registry: &Registry) -> Self {
        // ── Read metrics ─────────────────────────────────────────────
        let config_reads = IntCounterVec::new(
            Opts::new("ch_config_reads_total", "Total number of configuration reads"),
            &["outcome"],
        )
        .expect("failed to create config_reads metric");

        // ── Write metrics ────────────────────────────────────────────
        let version_appends = IntCounterVec::new(
            Opts::new("ch_version_appends_total", "Total number of versions appended"),
            &["kind"],
        )
        .expect("failed to create version_appends metric");

        let releases_total = IntCounterVec::new(
            Opts::new("ch_releases_total", "Total number of release operations"),
            &["kind"],
        )
        .expect("failed to create releases_total metric");

        // ── Gray metrics ─────────────────────────────────────────────
        let gray_resolutions = IntCounterVec::new(
            Opts::new(
                "ch_gray_resolutions_total",
                "Resolutions made while a gray release was active",
            ),
            &["result"],
        )
        .expect("failed to create gray_resolutions metric");

        // ── Long poll metrics ────────────────────────────────────────
        let long_polls_active = IntGauge::new(
            "ch_long_polls_active",
            "Number of long poll requests currently waiting",
        )
        .expect("failed to create long_polls_active metric");

        let long_poll_outcomes = IntCounterVec::new(
            Opts::new("ch_long_poll_outcomes_total", "Long poll completions by outcome"),
            &["outcome"],
        )
        .expect("failed to create long_poll_outcomes metric");

        // ── Hub metrics ──────────────────────────────────────────────
        let hub_publishes = IntCounterVec::new(
            Opts::new("ch_hub_publishes_total", "Change events published to the hub"),
            &["change_type"],
        )
        .expect("failed to create hub_publishes metric");

        let hub_dropped = IntCounter::new(
            "ch_hub_dropped_total",
            "Deliveries skipped because the subscriber queue was full or closed",
        )
        .expect("failed to create hub_dropped metric");

        // ── Auth metrics ─────────────────────────────────────────────
        let auth_failures = IntCounterVec::new(
            Opts::new("ch_auth_failures_total", "Rejected requests by reason"),
            &["reason"],
        )
        .expect("failed to create auth_failures metric");

        // ── Storage metrics ──────────────────────────────────────────
        let storage_backend = IntGaugeVec::new(
            Opts::new("ch_storage_backend", "Storage backend type (1=active)"),
            &["type"],
        )
        .expect("failed to create storage_backend metric");

        let storage_write_duration = HistogramVec::new(
            HistogramOpts::new(
                "ch_storage_write_duration_seconds",
                "Duration of storage write operations",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]),
            &["op"],
        )
        .expect("failed to create storage_write_duration metric");

        // ── HTTP request metrics ──────────────────────────────────────
        let http_requests_total = IntCounterVec::new(
            Opts::new("ch_http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )
        .expect("failed to create http_requests_total metric");

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "ch_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 30.0, 60.0]),
            &["method", "path"],
        )
        .expect("failed to create http_request_duration metric");

        registry.register(Box::new(config_reads.clone())).expect("register config_reads");
        registry.register(Box::new(version_appends.clone())).expect("register version_appends");
        registry.register(Box::new(releases_total.clone())).expect("register releases_total");
        registry.register(Box::new(gray_resolutions.clone())).expect("register gray_resolutions");
        registry.register(Box::new(long_polls_active.clone())).expect("register long_polls_active");
        registry.register(Box::new(long_poll_outcomes.clone())).expect("register long_poll_outcomes");
        registry.register(Box::new(hub_publishes.clone())).expect("register hub_publishes");
        registry.register(Box::new(hub_dropped.clone())).expect("register hub_dropped");
        registry.register(Box::new(auth_failures.clone())).expect("register auth_failures");
        registry.register(Box::new(storage_backend.clone())).expect("register storage_backend");
        registry.register(Box::new(storage_write_duration.clone())).expect("register storage_write_duration");
        registry.register(Box::new(http_requests_total.clone())).expect("register http_requests_total");
        registry.register(Box::new(http_request_duration.clone())).expect("register http_request_duration");

        Self {
            config_reads,
            version_appends,
            releases_total,
            gray_resolutions,
            long_polls_active,
            long_poll_outcomes,
            hub_publishes,
            hub_dropped,
            auth_failures,
            storage_backend,
            storage_write_duration,
            http_requests_total,
            http_request_duration,
        }
    }
}

/// Get the global metrics instance, initializing on first call
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = REGISTRY.get_or_init(Registry::new);
        Metrics::new(registry)
    })
}

/// Time a storage write and record it under `op`.
pub async fn timed_write<T, F>(op: &str, write: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let out = write.await;
    metrics()
        .storage_write_duration
        .with_label_values(&[op])
        .observe(start.elapsed().as_secs_f64());
    out
}

/// Axum handler for GET /metrics: Prometheus text format
pub async fn handle_metrics() -> Response {
    // Ensure all metric collectors are registered on first call.
    let _ = metrics();
    let registry = REGISTRY.get_or_init(Registry::new);
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Axum handler for GET /readyz: ready once the store answers.
pub async fn handle_readyz(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ready": true,
                "storage": state.storage.as_str(),
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "ready": false,
                    "reason": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// Axum middleware that records HTTP request count and duration.
pub async fn track_metrics(request: Request<axum::body::Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let m = metrics();
    m.http_requests_total
        .with_label_values(&[&method, &path, &status])
        .inc();
    m.http_request_duration
        .with_label_values(&[&method, &path])
        .observe(elapsed);

    response
}

/// Axum handler for GET /health: always 200
pub async fn handle_health_check() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}
