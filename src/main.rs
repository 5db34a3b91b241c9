use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod breaker;
mod config;
mod middleware;
mod routes;
mod server;
mod shutdown;
mod telemetry;

use breaker::Breaker;
use config::Cfg;
use routes::AppState;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing()?;

    // metrics (metrics 0.24 + prometheus 0.17)
    let prom = telemetry::install_metrics().context("install prometheus recorder")?;

    // config/env
    let cfg = Cfg::load()?;
    info!("cfg: {:?}", cfg);

    // circuit-breaker único, compartilhado por todas as requisições
    let breaker = Arc::new(
        Breaker::new(cfg.cb_interval, cfg.cb_threshold)
            .context("invalid circuit breaker configuration")?,
    );
    info!(
        threshold = breaker.threshold(),
        interval_ms = breaker.interval().as_millis() as u64,
        "circuit breaker ready"
    );

    let app = server::app(&cfg, AppState { breaker, prom });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    server::serve(listener, app, &cfg, shutdown::signal()).await?;
    info!("server stopped");
    Ok(())
}
