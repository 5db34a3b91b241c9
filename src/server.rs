/// Servidor HTTP/1.1 + h2c (HTTP/2 sem TLS, prior knowledge)
/// Accept loop próprio para aplicar os ajustes de HTTP/2 vindos da configuração
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, http::StatusCode, middleware::from_fn_with_state};
use hyper::{Request, body::Incoming};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::{conn::auto, graceful::GracefulShutdown},
};
use tokio::{net::TcpListener, sync::Semaphore};
use tower::ServiceExt;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    config::Cfg,
    middleware::circuit_breaker,
    routes::{self, AppState},
};

/// Monta o router com a cadeia de middlewares
/// Ordem (de fora para dentro): request-id → trace → breaker → catch-panic → timeout → handler
pub fn app(cfg: &Cfg, state: AppState) -> Router {
    let breaker = Arc::clone(&state.breaker);
    routes::router(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            cfg.request_timeout(),
        ))
        .layer(CatchPanicLayer::new())
        .layer(from_fn_with_state(breaker, circuit_breaker))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn connection_builder(cfg: &Cfg) -> auto::Builder<TokioExecutor> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(cfg.idle_timeout);
    // hyper não tem idle timeout para HTTP/2: pings de keep-alive derrubam conexões mortas
    builder
        .http2()
        .timer(TokioTimer::new())
        .max_concurrent_streams(cfg.max_concurrent_streams)
        .max_frame_size(cfg.max_read_frame_size)
        .keep_alive_interval(cfg.idle_timeout)
        .keep_alive_timeout(cfg.idle_timeout);
    builder
}

/// Aceita conexões até `shutdown` completar, depois drena as conexões abertas
/// por no máximo `cfg.shutdown_timeout`
pub async fn serve<F>(listener: TcpListener, app: Router, cfg: &Cfg, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let builder = connection_builder(cfg);
    let graceful = GracefulShutdown::new();
    let limit = Arc::new(Semaphore::new(cfg.concurrency_limit));
    let mut shutdown = std::pin::pin!(shutdown);

    info!("listening on {}", listener.local_addr()?);

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&limit).acquire_owned() => permit?,
            _ = &mut shutdown => break,
        };

        let (stream, peer): (_, SocketAddr) = tokio::select! {
            conn = listener.accept() => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };
        debug!(%peer, available = limit.available_permits(), "connection accepted");

        let svc = app.clone();
        let hyper_svc =
            hyper::service::service_fn(move |req: Request<Incoming>| svc.clone().oneshot(req));

        let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), hyper_svc);
        let conn = graceful.watch(conn.into_owned());
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%peer, "connection closed with error: {e}");
            }
            drop(permit);
        });
    }

    drop(listener);
    info!("draining open connections");
    tokio::select! {
        _ = graceful.shutdown() => info!("all connections closed"),
        _ = tokio::time::sleep(cfg.shutdown_timeout) => {
            warn!("shutdown timeout elapsed, dropping remaining connections");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::Breaker;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::sync::oneshot;

    fn state(cfg: &Cfg) -> AppState {
        AppState {
            breaker: Arc::new(Breaker::new(cfg.cb_interval, cfg.cb_threshold).unwrap()),
            prom: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    #[tokio::test]
    async fn serves_h2c_and_stops_on_shutdown() {
        let cfg = Cfg {
            shutdown_timeout: Duration::from_secs(1),
            ..Cfg::default()
        };
        let app = app(&cfg, state(&cfg));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve(listener, app, &cfg, async {
                let _ = rx.await;
            })
            .await
        });

        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .build()
            .unwrap();

        let res = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.version(), reqwest::Version::HTTP_2);
        assert_eq!(res.status(), 200);
        assert!(res.headers().contains_key("x-request-id"));
        assert_eq!(res.text().await.unwrap(), "ok");

        let res = client
            .get(format!("http://{addr}/breaker"))
            .send()
            .await
            .unwrap();
        let json: serde_json::Value = res.json().await.unwrap();
        assert_eq!(json["state"], "closed");

        tx.send(()).unwrap();
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn zero_stream_limit_still_serves_h2() {
        let cfg = Cfg::from_lookup(|k| match k {
            "MAX_CONCURRENT_STREAMS" => Some("0".into()),
            "SHUTDOWN_TIMEOUT" => Some("1".into()),
            _ => None,
        })
        .unwrap();
        let app = app(&cfg, state(&cfg));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve(listener, app, &cfg, async {
                let _ = rx.await;
            })
            .await
        });

        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let res = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.version(), reqwest::Version::HTTP_2);
        assert_eq!(res.status(), 200);

        tx.send(()).unwrap();
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn http1_clients_are_still_served() {
        let cfg = Cfg::default();
        let app = app(&cfg, state(&cfg));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve(listener, app, &cfg, async {
                let _ = rx.await;
            })
            .await
        });

        let client = reqwest::Client::builder().http1_only().build().unwrap();
        let res = client
            .get(format!("http://{addr}/readyz"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.version(), reqwest::Version::HTTP_11);
        assert_eq!(res.text().await.unwrap(), "ready");

        tx.send(()).unwrap();
        drop(client);
        tokio::time::timeout(Duration::from_secs(15), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
