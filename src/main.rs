//! fare-radar worker: runs the monitor scheduler and async search workers against the
//! in-memory store, and serves Prometheus metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fare_radar::metrics::Metrics;
use fare_radar::store::MemoryStore;
use fare_radar::{AppConfig, FareRadar, Stores};

/// `RUST_LOG` filter (default `fare_radar=info,warn`); `LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fare_radar=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load().context("loading config")?;

    let metrics = Metrics::install(&cfg)?;
    let server = metrics.serve(&cfg.metrics_addr).await?;

    let store = Arc::new(MemoryStore::new());
    let stores = Stores {
        usage: store.clone(),
        monitors: store.clone(),
        notifications: store,
    };
    let radar = FareRadar::from_config(&cfg, stores)?;
    let handles = radar.start_background().await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    for h in handles {
        h.abort();
    }
    server.abort();
    Ok(())
}
