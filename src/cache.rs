//! Fingerprint-keyed TTL cache with single-flight production.
//!
//! At most one producer runs per fingerprint; concurrent callers subscribe to its
//! outcome through a `watch` channel. Failures are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::SearchError;
use crate::model::{AggregatedResult, Fingerprint};

type Outcome = Result<Arc<AggregatedResult>, SearchError>;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("search_cache_hits_total", "Lookups served from a live entry.");
        describe_counter!("search_cache_misses_total", "Lookups that ran the producer.");
        describe_counter!(
            "search_cache_coalesced_total",
            "Lookups that waited on another caller's in-flight producer."
        );
        describe_gauge!("search_cache_entries", "Live plus in-flight cache slots.");
    });
}

enum Slot {
    Ready {
        result: Arc<AggregatedResult>,
        expires_at: Instant,
    },
    InFlight {
        rx: watch::Receiver<Option<Outcome>>,
        token: u64,
    },
}

enum Step {
    Hit(Arc<AggregatedResult>),
    Wait(watch::Receiver<Option<Outcome>>),
    Lead(watch::Sender<Option<Outcome>>, u64),
}

pub struct ResultCache {
    ttl: Duration,
    producer_timeout: Duration,
    slots: Mutex<HashMap<Fingerprint, Slot>>,
    next_token: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration, producer_timeout: Duration) -> Self {
        ensure_metrics_described();
        Self {
            ttl,
            producer_timeout,
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Live entry for `fp`, if any. Expired entries read as absent.
    pub fn get(&self, fp: &Fingerprint) -> Option<Arc<AggregatedResult>> {
        match self.slots.lock().get(fp) {
            Some(Slot::Ready { result, expires_at }) if *expires_at > Instant::now() => {
                Some(result.clone())
            }
            _ => None,
        }
    }

    pub fn invalidate(&self, fp: &Fingerprint) {
        let mut g = self.slots.lock();
        if matches!(g.get(fp), Some(Slot::Ready { .. })) {
            g.remove(fp);
        }
    }

    /// Drops expired entries; in-flight slots are left alone.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut g = self.slots.lock();
        let before = g.len();
        g.retain(|_, s| match s {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::InFlight { .. } => true,
        });
        gauge!("search_cache_entries").set(g.len() as f64);
        before - g.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached result for `fp` or runs `producer` exactly once among all
    /// concurrent callers. A waiter whose leader was canceled or dropped takes over.
    pub async fn get_or_fetch<F, Fut>(&self, fp: &Fingerprint, producer: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AggregatedResult, SearchError>>,
    {
        let mut producer = Some(producer);
        loop {
            match self.step(fp) {
                Step::Hit(r) => {
                    counter!("search_cache_hits_total").increment(1);
                    return Ok(r);
                }
                Step::Wait(mut rx) => {
                    counter!("search_cache_coalesced_total").increment(1);
                    let seen = rx.wait_for(Option::is_some).await.ok().and_then(|v| v.clone());
                    match seen {
                        Some(Err(SearchError::Canceled)) | None => {
                            tracing::debug!(target: "cache", fingerprint = %fp, "leader gone, retrying");
                            continue;
                        }
                        Some(outcome) => return outcome,
                    }
                }
                Step::Lead(tx, token) => {
                    counter!("search_cache_misses_total").increment(1);
                    let Some(produce) = producer.take() else {
                        // Leading always returns, so the producer is still unused here.
                        self.abandon(fp, token);
                        return Err(SearchError::Canceled);
                    };
                    return self.lead(fp, tx, token, produce).await;
                }
            }
        }
    }

    fn step(&self, fp: &Fingerprint) -> Step {
        let mut g = self.slots.lock();
        match g.get(fp) {
            Some(Slot::Ready { result, expires_at }) if *expires_at > Instant::now() => {
                return Step::Hit(result.clone());
            }
            Some(Slot::InFlight { rx, .. }) => return Step::Wait(rx.clone()),
            _ => {}
        }
        let (tx, rx) = watch::channel(None);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        g.insert(fp.clone(), Slot::InFlight { rx, token });
        gauge!("search_cache_entries").set(g.len() as f64);
        Step::Lead(tx, token)
    }

    async fn lead<F, Fut>(
        &self,
        fp: &Fingerprint,
        tx: watch::Sender<Option<Outcome>>,
        token: u64,
        produce: F,
    ) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AggregatedResult, SearchError>>,
    {
        let mut guard = AbandonGuard {
            cache: self,
            fp,
            token,
            armed: true,
        };

        let outcome: Outcome = match tokio::time::timeout(self.producer_timeout, produce()).await
        {
            Ok(Ok(r)) => Ok(Arc::new(r)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SearchError::Timeout(self.producer_timeout.as_millis() as u64)),
        };

        {
            let mut g = self.slots.lock();
            let ours = matches!(g.get(fp), Some(Slot::InFlight { token: t, .. }) if *t == token);
            if ours {
                match &outcome {
                    Ok(r) => {
                        g.insert(
                            fp.clone(),
                            Slot::Ready {
                                result: r.clone(),
                                expires_at: Instant::now() + self.ttl,
                            },
                        );
                    }
                    Err(_) => {
                        g.remove(fp);
                    }
                }
            }
            gauge!("search_cache_entries").set(g.len() as f64);
        }
        guard.armed = false;

        if let Err(e) = &outcome {
            tracing::debug!(target: "cache", fingerprint = %fp, error = %e, "producer failed, nothing cached");
        }
        tx.send_replace(Some(outcome.clone()));
        outcome
    }

    fn abandon(&self, fp: &Fingerprint, token: u64) {
        let mut g = self.slots.lock();
        if matches!(g.get(fp), Some(Slot::InFlight { token: t, .. }) if *t == token) {
            g.remove(fp);
        }
    }
}

/// Clears our in-flight slot if the leading future is dropped before finishing.
/// Dropping the sender wakes waiters, which then retry.
struct AbandonGuard<'a> {
    cache: &'a ResultCache,
    fp: &'a Fingerprint,
    token: u64,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abandon(self.fp, self.token);
        }
    }
}
