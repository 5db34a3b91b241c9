/// Middleware de admissão: consulta o circuit breaker antes de cada requisição
/// e reporta o resultado do handler depois
use std::{sync::Arc, time::Instant};

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::breaker::{Admission, Breaker};

#[derive(Serialize)]
struct Rejected {
    message: &'static str,
}

pub async fn circuit_breaker(
    State(breaker): State<Arc<Breaker>>,
    req: Request,
    next: Next,
) -> Response {
    let admission = breaker.admit();
    if admission == Admission::Rejected {
        metrics::counter!("circuit_breaker_rejections_total").increment(1);
        debug!(
            path = %req.uri().path(),
            state = breaker.state().as_str(),
            "rejected by circuit breaker"
        );
        return unavailable(&breaker);
    }

    let in_flight = InFlight::new(&breaker, admission == Admission::Trial);
    let start = Instant::now();
    let resp = next.run(req).await;
    let status = resp.status();

    metrics::histogram!("http_request_duration_ms").record(start.elapsed().as_secs_f64() * 1e3);
    metrics::counter!("http_requests_total", "status" => status.as_u16().to_string()).increment(1);

    in_flight.settle(is_failure(status));
    resp
}

/// 5xx, ou 408 gerado pelo TimeoutLayer, contam como falha
pub fn is_failure(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT
}

fn unavailable(breaker: &Breaker) -> Response {
    let retry_after = breaker.interval().as_secs_f64().ceil().max(1.0) as u64;
    let mut resp = (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(Rejected {
            message: "service unavailable",
        }),
    )
        .into_response();
    resp.headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    resp
}

/// Uma requisição admitida ainda sem resultado
/// Se for descartada (cliente desconectou, panic) só a tentativa do half-open conta como falha,
/// para o estado não ficar preso; cancelamentos comuns são neutros
struct InFlight<'a> {
    breaker: &'a Breaker,
    trial: bool,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(breaker: &'a Breaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(mut self, failed: bool) {
        self.settled = true;
        if failed {
            self.breaker.on_failure();
        } else {
            self.breaker.on_success();
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.trial {
            warn!("half-open request dropped before completion");
            self.breaker.on_failure();
        } else {
            debug!("admitted request dropped before completion");
        }
    }
}
