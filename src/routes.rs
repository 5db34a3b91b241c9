/// Rotas operacionais: health, readiness, métricas e estado do breaker
use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::breaker::{Breaker, BreakerSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub breaker: Arc<Breaker>,
    pub prom: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ready" }))
        .route("/metrics", get(render_metrics))
        .route("/breaker", get(breaker_status))
        .with_state(state)
}

async fn render_metrics(State(st): State<AppState>) -> String {
    st.prom.render()
}

async fn breaker_status(State(st): State<AppState>) -> Json<BreakerSnapshot> {
    Json(st.breaker.snapshot())
}
