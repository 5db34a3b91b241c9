/// Logging estruturado e registro de métricas (tracing + prometheus)
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() -> anyhow::Result<()> {
    // tracing enxuto; RUST_LOG sobrescreve
    let filter = EnvFilter::from_default_env()
        .add_directive("h2_breaker=info".parse()?)
        .add_directive("axum=warn".parse()?)
        .add_directive("tower_http=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing init: {e}"))
}

/// Instala o recorder global e descreve as métricas expostas em /metrics
pub fn install_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_gauge!(
        "circuit_breaker_state",
        "current breaker state (0 closed, 1 open, 2 half-open)"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "breaker state transitions by origin and destination"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "requests short-circuited while the breaker refused admission"
    );
    describe_counter!(
        "http_requests_total",
        "admitted requests by response status"
    );
    describe_histogram!(
        "http_request_duration_ms",
        Unit::Milliseconds,
        "latency of admitted requests"
    );
}
