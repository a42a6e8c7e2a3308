//! Staged multi-source search: A and B in parallel, then C over their merge.
//!
//! Individual source failures are recorded on the result; only a run in which every
//! configured source failed is an error. Results go through the `ResultCache`, so
//! equal fingerprints share one pipeline run.
//!
//! Stage C is never retried and only gets what is left of `pipeline_budget` after A and
//! B, so a slow reasoning provider degrades the run instead of timing out the producer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::error::{SearchError, SourceError};
use crate::model::{AggregatedResult, CompressionStats, NormalizedFlight, SearchQuery, SourceId};
use crate::normalize::normalize;
use crate::sources::{DynAdapter, RawSourceResult, SourceRegistry};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "source_fetch_total",
            "Adapter calls by source and outcome (ok, timeout, rate_limited, upstream, invalid_query, cooldown)."
        );
        describe_histogram!("source_fetch_ms", "Adapter call latency in milliseconds.");
        describe_counter!(
            "aggregator_runs_total",
            "Pipeline runs by outcome (full, partial, failed, canceled)."
        );
        describe_histogram!(
            "normalize_reduction_ratio",
            "Payload size reduction per normalization pass, percent."
        );
    });
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Per-call timeout for Stage A and Stage B.
    pub source_timeout: Duration,
    pub reasoning_timeout: Duration,
    /// Extra attempts for `Timeout`/`Upstream` failures.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// A source that answered `RateLimited` is skipped for this long.
    pub rate_limit_cooldown: Duration,
    /// Width of the price bucket used in the dedup key.
    pub price_bucket: f64,
    /// Whole-run budget; matches the cache producer timeout.
    pub pipeline_budget: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(20),
            reasoning_timeout: Duration::from_secs(60),
            max_retries: 1,
            retry_backoff: Duration::from_millis(250),
            rate_limit_cooldown: Duration::from_secs(60),
            price_bucket: 50.0,
            pipeline_budget: Duration::from_secs(120),
        }
    }
}

/// Kept back from Stage C for merging and the cache write.
const FINALIZE_RESERVE: Duration = Duration::from_millis(250);

/// Cooperative cancellation flag shared between a task handle and its pipeline run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Coarse pipeline position, reported to progress observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Sources,
    Reasoning,
    Finalizing,
}

pub struct Aggregator {
    registry: SourceRegistry,
    cache: Arc<ResultCache>,
    cfg: AggregatorConfig,
    cooldowns: Mutex<HashMap<SourceId, Instant>>,
}

impl Aggregator {
    pub fn new(registry: SourceRegistry, cache: Arc<ResultCache>, cfg: AggregatorConfig) -> Self {
        ensure_metrics_described();
        Self {
            registry,
            cache,
            cfg,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn has_reasoning(&self) -> bool {
        self.registry.reasoning.is_some()
    }

    pub async fn search(
        &self,
        query: &SearchQuery,
        cancel: &CancelToken,
    ) -> Result<Arc<AggregatedResult>, SearchError> {
        self.search_with_progress(query, cancel, &|_| {}).await
    }

    pub async fn search_with_progress(
        &self,
        query: &SearchQuery,
        cancel: &CancelToken,
        progress: &(dyn Fn(PipelineStage) + Send + Sync),
    ) -> Result<Arc<AggregatedResult>, SearchError> {
        if cancel.is_canceled() {
            return Err(SearchError::Canceled);
        }
        let fp = query.fingerprint();
        self.cache
            .get_or_fetch(&fp, || self.run_pipeline(query, cancel, progress))
            .await
    }

    async fn run_pipeline(
        &self,
        query: &SearchQuery,
        cancel: &CancelToken,
        progress: &(dyn Fn(PipelineStage) + Send + Sync),
    ) -> Result<AggregatedResult, SearchError> {
        let fp = query.fingerprint();
        let started = Instant::now();
        progress(PipelineStage::Sources);

        let (a, b) = tokio::join!(
            self.run_slot(self.registry.primary.as_ref(), query, self.cfg.source_timeout),
            self.run_slot(self.registry.alternate.as_ref(), query, self.cfg.source_timeout),
        );

        let mut succeeded = BTreeSet::new();
        let mut failed = BTreeMap::new();
        let mut stats = Vec::new();
        let mut flights = Vec::new();
        for (id, outcome) in [a, b].into_iter().flatten() {
            match outcome {
                Ok(raw) => {
                    let n = normalize(&raw, query.currency());
                    histogram!("normalize_reduction_ratio").record(n.stats.reduction_ratio);
                    debug!(target: "aggregator", source = %id, kept = n.flights.len(), rejected = n.rejected, "normalized");
                    stats.push(n.stats);
                    flights.extend(n.flights);
                    succeeded.insert(id);
                }
                Err(e) => {
                    failed.insert(id, e.reason().to_string());
                }
            }
        }
        let merged = merge_flights(flights, self.cfg.price_bucket);

        if cancel.is_canceled() {
            counter!("aggregator_runs_total", "outcome" => "canceled").increment(1);
            return Err(SearchError::Canceled);
        }

        let mut report = None;
        let mut recommended = Vec::new();
        if let Some(ai) = &self.registry.reasoning {
            progress(PipelineStage::Reasoning);
            let left = self
                .cfg
                .pipeline_budget
                .saturating_sub(started.elapsed())
                .saturating_sub(FINALIZE_RESERVE);
            let budget = self.cfg.reasoning_timeout.min(left);
            let res = if budget.is_zero() {
                Err(SourceError::Timeout(0))
            } else {
                self.run_source(ai, query, &merged, budget, 0).await
            };
            match res {
                Ok(raw) => {
                    let n = normalize(&raw, query.currency());
                    histogram!("normalize_reduction_ratio").record(n.stats.reduction_ratio);
                    stats.push(n.stats);
                    recommended = picked_tokens(&merged, &n.flights);
                    report = n.report;
                    succeeded.insert(SourceId::Reasoning);
                }
                Err(e) => {
                    warn!(target: "aggregator", fingerprint = %fp, budget_ms = budget.as_millis() as u64, error = %e, "reasoning stage failed, degrading to engine merge");
                    failed.insert(SourceId::Reasoning, e.reason().to_string());
                }
            }
        }

        if succeeded.is_empty() {
            counter!("aggregator_runs_total", "outcome" => "failed").increment(1);
            warn!(target: "aggregator", fingerprint = %fp, failed = ?failed, "all sources failed");
            return Err(SearchError::AllSourcesFailed(failed.into_iter().collect()));
        }

        progress(PipelineStage::Finalizing);
        if cancel.is_canceled() {
            counter!("aggregator_runs_total", "outcome" => "canceled").increment(1);
            return Err(SearchError::Canceled);
        }

        let outcome = if failed.is_empty() { "full" } else { "partial" };
        counter!("aggregator_runs_total", "outcome" => outcome).increment(1);
        info!(
            target: "aggregator",
            fingerprint = %fp,
            flights = merged.len(),
            succeeded = ?succeeded,
            failed = ?failed,
            "search aggregated"
        );

        let report = report.unwrap_or_else(|| fallback_report(&merged));
        Ok(AggregatedResult {
            query_fingerprint: fp,
            flights: merged,
            sources_succeeded: succeeded,
            sources_failed: failed,
            compression_stats: CompressionStats::combine(&stats),
            report,
            recommended,
            produced_at: Utc::now(),
        })
    }

    async fn run_slot(
        &self,
        adapter: Option<&DynAdapter>,
        query: &SearchQuery,
        timeout: Duration,
    ) -> Option<(SourceId, Result<RawSourceResult, SourceError>)> {
        let adapter = adapter?;
        Some((
            adapter.id(),
            self.run_source(adapter, query, &[], timeout, self.cfg.max_retries)
                .await,
        ))
    }

    /// One source with timeout, up to `retries` extra attempts and rate-limit cooldown.
    async fn run_source(
        &self,
        adapter: &DynAdapter,
        query: &SearchQuery,
        context: &[NormalizedFlight],
        timeout: Duration,
        retries: u32,
    ) -> Result<RawSourceResult, SourceError> {
        let id = adapter.id();
        if self.cooling_down(id) {
            counter!("source_fetch_total", "source" => id.label(), "outcome" => "cooldown")
                .increment(1);
            debug!(target: "aggregator", source = %id, "skipped, rate-limit cooldown");
            return Err(SourceError::RateLimited);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let t0 = Instant::now();
            let res = match tokio::time::timeout(timeout, adapter.fetch(query, context, timeout)).await
            {
                Ok(r) => r,
                Err(_) => Err(SourceError::Timeout(timeout.as_millis() as u64)),
            };
            histogram!("source_fetch_ms", "source" => id.label())
                .record(t0.elapsed().as_secs_f64() * 1_000.0);

            let e = match res {
                Ok(raw) => {
                    counter!("source_fetch_total", "source" => id.label(), "outcome" => "ok")
                        .increment(1);
                    return Ok(raw);
                }
                Err(e) => e,
            };
            counter!("source_fetch_total", "source" => id.label(), "outcome" => e.reason())
                .increment(1);

            if e == SourceError::RateLimited {
                self.cooldowns
                    .lock()
                    .insert(id, Instant::now() + self.cfg.rate_limit_cooldown);
                warn!(target: "aggregator", source = %id, provider = adapter.name(), "rate limited, cooling down");
                return Err(e);
            }
            if e.is_retryable() && attempt <= retries {
                debug!(target: "aggregator", source = %id, attempt, error = %e, "retrying source");
                tokio::time::sleep(self.cfg.retry_backoff * (1u32 << (attempt - 1).min(6))).await;
                continue;
            }
            warn!(target: "aggregator", source = %id, provider = adapter.name(), attempt, error = ?e, "source failed");
            return Err(e);
        }
    }

    fn cooling_down(&self, id: SourceId) -> bool {
        let mut g = self.cooldowns.lock();
        match g.get(&id) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                g.remove(&id);
                false
            }
            None => false,
        }
    }
}

/// `(route, departure minute, price bucket)`
pub fn dedup_key(f: &NormalizedFlight, bucket: f64) -> (String, String, i64) {
    let departs = f
        .departs_at()
        .map(|d| d.format("%Y-%m-%dT%H:%M").to_string())
        .unwrap_or_default();
    (f.route(), departs, (f.price / bucket).floor() as i64)
}

/// Dedups by [`dedup_key`], keeping the lower price, then fewer stops; full ties keep
/// the earlier entry. Output is sorted by price, stops, departure.
pub fn merge_flights(
    flights: impl IntoIterator<Item = NormalizedFlight>,
    bucket: f64,
) -> Vec<NormalizedFlight> {
    let bucket = if bucket > 0.0 { bucket } else { 1.0 };
    let mut index: HashMap<(String, String, i64), usize> = HashMap::new();
    let mut out: Vec<NormalizedFlight> = Vec::new();
    for f in flights {
        let key = dedup_key(&f, bucket);
        match index.get(&key) {
            Some(&i) => {
                let cur = &out[i];
                if f.price < cur.price || (f.price == cur.price && f.stops < cur.stops) {
                    out[i] = f;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(f);
            }
        }
    }
    out.sort_by(|a, b| {
        a.price
            .total_cmp(&b.price)
            .then(a.stops.cmp(&b.stops))
            .then(a.departs_at().cmp(&b.departs_at()))
    });
    out
}

/// Tokens of the Stage C picks that exist in the merge, in the model's order.
fn picked_tokens(merged: &[NormalizedFlight], picks: &[NormalizedFlight]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for p in picks {
        if merged.iter().any(|f| f.booking_token == p.booking_token)
            && !out.contains(&p.booking_token)
        {
            out.push(p.booking_token.clone());
        }
    }
    out
}

/// Deterministic markdown summary used when the reasoning stage is absent or failed.
pub fn fallback_report(flights: &[NormalizedFlight]) -> String {
    let mut out = String::from("## Flight search summary\n\n");
    match flights.first() {
        None => out.push_str("No bookable flights were found for this route.\n"),
        Some(cheapest) => {
            let cur = &cheapest.currency;
            let avg = flights.iter().map(|f| f.price).sum::<f64>() / flights.len() as f64;
            out.push_str(&format!("- Options found: {}\n", flights.len()));
            out.push_str(&format!("- Lowest price: {:.0} {cur}\n", cheapest.price));
            out.push_str(&format!("- Average price: {avg:.0} {cur}\n"));
            let first_leg = cheapest
                .legs
                .first()
                .map(|l| format!("{}{}", l.carrier, l.flight_number))
                .unwrap_or_default();
            let departs = cheapest
                .departs_at()
                .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            out.push_str(&format!(
                "- Cheapest: {} {} departing {}, {} stop(s)\n",
                cheapest.route(),
                first_leg,
                departs,
                cheapest.stops
            ));
            if let Some(h) = &cheapest.hidden_destination {
                out.push_str(&format!(
                    "- Note: hidden-city ticket booked through to {h}; do not check bags.\n"
                ));
            }
        }
    }
    out.push_str("\n_AI analysis is unavailable for this search; figures come straight from the fare engines._\n");
    out
}
