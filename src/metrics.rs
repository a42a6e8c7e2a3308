//! Prometheus exposition for the worker: recorder setup, `/metrics` and `/healthz`.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;

pub const SERVICE: &str = "fare-radar";

/// Milliseconds; spans a cached fixture hit up to a reasoning call near its timeout.
const FETCH_MS_BUCKETS: &[f64] = &[
    50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 20_000.0, 60_000.0,
];
const RATIO_BUCKETS: &[f64] = &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .add_global_label("service", SERVICE)
        .set_buckets_for_metric(Matcher::Full("source_fetch_ms".into()), FETCH_MS_BUCKETS)
        .and_then(|b| {
            b.set_buckets_for_metric(
                Matcher::Full("normalize_reduction_ratio".into()),
                RATIO_BUCKETS,
            )
        })
        .context("prometheus: histogram buckets")
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Installs the global Prometheus recorder and publishes the static config gauges.
    /// Call once per process.
    pub fn install(cfg: &AppConfig) -> Result<Self> {
        let handle = builder()?
            .install_recorder()
            .context("prometheus: install recorder")?;

        gauge!("search_cache_ttl_secs").set(cfg.cache.ttl_secs as f64);
        gauge!("search_pipeline_timeout_secs").set(cfg.pipeline_timeout().as_secs_f64());
        gauge!("scheduler_workers").set(cfg.scheduler.workers as f64);

        Ok(Self { handle })
    }

    /// `/metrics` in the Prometheus exposition format plus a plain `/healthz`.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route(
                "/metrics",
                get(move || {
                    let h = handle.clone();
                    async move { h.render() }
                }),
            )
            .route("/healthz", get(|| async { "ok" }))
    }

    /// Binds `addr` and serves `router()` in the background.
    pub async fn serve(&self, addr: &str) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding metrics listener on {addr}"))?;
        info!(target: "metrics", addr, "serving /metrics");
        let router = self.router();
        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(target: "metrics", "metrics server stopped: {e:#}");
            }
        }))
    }
}
