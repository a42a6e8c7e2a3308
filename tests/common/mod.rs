// tests/common/mod.rs
// Shared scripted adapters, a recording channel sender and builders for the pipeline.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use fare_radar::aggregator::{Aggregator, AggregatorConfig};
use fare_radar::cache::ResultCache;
use fare_radar::error::{NotifyError, SourceError};
use fare_radar::model::{NormalizedFlight, SearchQuery, SourceId};
use fare_radar::notify::{Channel, ChannelSender, NotificationPayload};
use fare_radar::sources::{RawSourceResult, SourceAdapter, SourceRegistry};

/// Adapter whose answer, latency and call count are controlled by the test.
pub struct ScriptedAdapter {
    id: SourceId,
    result: Mutex<Result<Value, SourceError>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn ok(id: SourceId, payload: Value) -> Arc<Self> {
        Arc::new(Self {
            id,
            result: Mutex::new(Ok(payload)),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(id: SourceId, e: SourceError) -> Arc<Self> {
        let a = Self::ok(id, Value::Null);
        a.set_result(Err(e));
        a
    }

    pub fn set_result(&self, r: Result<Value, SourceError>) {
        *self.result.lock() = r;
    }

    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock() = d;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    async fn fetch(
        &self,
        query: &SearchQuery,
        _context: &[NormalizedFlight],
        _timeout: Duration,
    ) -> Result<RawSourceResult, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let r = self.result.lock().clone();
        r.map(|payload| RawSourceResult::new(self.id, query, payload))
    }

    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Stage A payload: one direct PVG→JFK group per `(price, token)`, ten minutes apart.
pub fn primary_payload(offers: &[(f64, &str)]) -> Value {
    let groups: Vec<Value> = offers
        .iter()
        .enumerate()
        .map(|(i, (price, token))| {
            json!({
                "flights": [{
                    "departure_airport": {"id": "PVG", "time": format!("2025-09-15 10:{:02}", i * 10)},
                    "arrival_airport": {"id": "JFK", "time": "2025-09-15 23:30"},
                    "airline": "China Eastern",
                    "flight_number": format!("MU {}", 500 + i)
                }],
                "total_duration": 800,
                "price": price,
                "booking_token": token
            })
        })
        .collect();
    json!({"search_metadata": {"status": "Success"}, "best_flights": groups})
}

/// Stage B payload with one itinerary per `(price, id)`, departing at 14:xx.
pub fn alternate_payload(offers: &[(f64, &str)]) -> Value {
    let its: Vec<Value> = offers
        .iter()
        .enumerate()
        .map(|(i, (price, id))| {
            json!({
                "id": id,
                "price": {"amount": price.to_string()},
                "duration": 46_800,
                "segments": [{
                    "from": "PVG", "to": "JFK", "carrier": "UA", "flight_no": format!("{}", 80 + i),
                    "departure": format!("2025-09-15T14:{:02}:00", i * 10),
                    "arrival": "2025-09-16T03:00:00"
                }]
            })
        })
        .collect();
    json!({"currency": "CNY", "itineraries": its})
}

pub fn fast_config() -> AggregatorConfig {
    AggregatorConfig {
        source_timeout: Duration::from_millis(300),
        reasoning_timeout: Duration::from_millis(300),
        max_retries: 0,
        retry_backoff: Duration::from_millis(5),
        rate_limit_cooldown: Duration::from_secs(60),
        price_bucket: 50.0,
        pipeline_budget: Duration::from_secs(5),
    }
}

pub fn aggregator(registry: SourceRegistry, cfg: AggregatorConfig) -> Arc<Aggregator> {
    let cache = Arc::new(ResultCache::new(Duration::from_secs(60), Duration::from_secs(5)));
    Arc::new(Aggregator::new(registry, cache, cfg))
}

pub fn sha_nyc() -> SearchQuery {
    SearchQuery::one_way("SHA", "NYC", NaiveDate::from_ymd_opt(2025, 9, 15).unwrap())
}

/// SHA→NYC departing `days` from today; monitors need a future departure.
pub fn sha_nyc_in(days: u64) -> SearchQuery {
    let d = Utc::now().date_naive().checked_add_days(Days::new(days)).unwrap();
    SearchQuery::one_way("SHA", "NYC", d)
}

/// Channel sender that records deliveries and can be told to fail.
pub struct MockSink {
    channel: Channel,
    fail_with: Mutex<Option<NotifyError>>,
    delay: Mutex<Duration>,
    delivered: Mutex<Vec<(String, NotificationPayload)>>,
    attempts: AtomicUsize,
}

impl MockSink {
    pub fn new(channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            fail_with: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn fail_with(&self, e: Option<NotifyError>) {
        *self.fail_with.lock() = e;
    }

    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock() = d;
    }

    pub fn delivered(&self) -> Vec<(String, NotificationPayload)> {
        self.delivered.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for MockSink {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.fail_with.lock().clone() {
            return Err(e);
        }
        self.delivered
            .lock()
            .push((recipient.to_string(), payload.clone()));
        Ok(())
    }
}
