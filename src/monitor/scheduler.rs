//! Drives recurring monitor checks.
//!
//! Due monitors sit in a min-heap keyed by `next_check_at`. A tick pops everything due
//! and hands each id to a bounded worker pool; a check first takes the monitor's lease,
//! so the same monitor is never checked twice at once. Leases carry a token and expire
//! after `lease_ttl`, and a check whose lease was lost drops its results.
//!
//! Status changes go through `save_monitor_if`: a check only writes back while the
//! stored monitor is still `Checking`, so a deactivation issued mid-check wins.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{MonitorStatus, MonitorTask};
use crate::aggregator::{Aggregator, CancelToken};
use crate::error::MonitorError;
use crate::model::{AggregatedResult, SearchQuery};
use crate::notify::antiflutter::{AlertMark, AntiFlutter};
use crate::notify::{
    idempotency_key, render, ChannelTarget, NotificationDispatcher, NotificationPayload,
    SendOutcome,
};
use crate::quota::{Metric, Principal, QuotaEnforcer};
use crate::store::MonitorStore;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "monitor_checks_total",
            "Monitor checks by outcome (ok, alerted, failed, suspended, expired, skipped)."
        );
        describe_counter!(
            "monitor_suspended_total",
            "Monitors auto-suspended after consecutive failed checks."
        );
    });
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub tick: Duration,
    pub lease_ttl: Duration,
    /// Consecutive failed checks before a monitor is suspended.
    pub failure_threshold: u32,
    pub alert_cooldown_secs: i64,
    /// Width of the price bucket in notification idempotency keys.
    pub price_bucket: f64,
    pub min_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            tick: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(120),
            failure_threshold: 5,
            alert_cooldown_secs: 10_800,
            price_bucket: 50.0,
            min_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// `alerted` counts the channels that actually sent a price alert.
    Checked { price: Option<f64>, alerted: usize },
    Failed { failures: u32 },
    Suspended,
    /// Departure date passed; the monitor was deactivated.
    Expired,
    /// Lease held elsewhere, monitor not due, or changed by someone else mid-check.
    /// Nothing from the check was written back.
    Skipped,
}

impl CheckOutcome {
    fn label(&self) -> &'static str {
        match self {
            CheckOutcome::Checked { alerted, .. } if *alerted > 0 => "alerted",
            CheckOutcome::Checked { .. } => "ok",
            CheckOutcome::Failed { .. } => "failed",
            CheckOutcome::Suspended => "suspended",
            CheckOutcome::Expired => "expired",
            CheckOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

struct Inner {
    store: Arc<dyn MonitorStore>,
    aggregator: Arc<Aggregator>,
    dispatcher: Arc<NotificationDispatcher>,
    quota: Arc<QuotaEnforcer>,
    cfg: SchedulerConfig,
    anti_flutter: AntiFlutter,
    queue: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, u64)>>>,
    leases: Mutex<HashMap<u64, Lease>>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct MonitorScheduler {
    inner: Arc<Inner>,
}

impl MonitorScheduler {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        aggregator: Arc<Aggregator>,
        dispatcher: Arc<NotificationDispatcher>,
        quota: Arc<QuotaEnforcer>,
        cfg: SchedulerConfig,
    ) -> Self {
        ensure_metrics_described();
        let permits = Arc::new(Semaphore::new(cfg.workers.max(1)));
        let anti_flutter = AntiFlutter::new(cfg.alert_cooldown_secs);
        Self {
            inner: Arc::new(Inner {
                store,
                aggregator,
                dispatcher,
                quota,
                cfg,
                anti_flutter,
                queue: Mutex::new(BinaryHeap::new()),
                leases: Mutex::new(HashMap::new()),
                permits,
            }),
        }
    }

    /// Rebuilds the ready queue from the store. Monitors left in `Checking` by a
    /// previous process go back to `Active`.
    pub async fn load(&self) -> Result<usize, MonitorError> {
        let tasks = self.inner.store.list_schedulable().await?;
        let n = tasks.len();
        for mut t in tasks {
            if t.status == MonitorStatus::Checking {
                t.status = MonitorStatus::Active;
                self.inner.store.save_monitor(&t).await?;
            }
            self.inner.enqueue(t.next_check_at, t.id);
        }
        info!(target: "scheduler", monitors = n, "ready queue loaded");
        Ok(n)
    }

    pub async fn create_monitor(
        &self,
        principal: &Principal,
        query: SearchQuery,
        price_threshold: f64,
        check_interval_secs: u64,
        channels: Vec<ChannelTarget>,
    ) -> Result<MonitorTask, MonitorError> {
        query.validate().map_err(MonitorError::Invalid)?;
        if !price_threshold.is_finite() || price_threshold <= 0.0 {
            return Err(MonitorError::Invalid(format!(
                "price threshold must be positive, got {price_threshold}"
            )));
        }
        if check_interval_secs < self.inner.cfg.min_interval_secs {
            return Err(MonitorError::Invalid(format!(
                "check interval {check_interval_secs}s is below the minimum of {}s",
                self.inner.cfg.min_interval_secs
            )));
        }
        if channels.is_empty() {
            return Err(MonitorError::Invalid("no notification channel given".into()));
        }

        let (ok, active, limit) = self
            .inner
            .quota
            .has_capacity(principal, Metric::Monitor)
            .await?;
        if !ok {
            let limit = limit.unwrap_or(0);
            info!(target: "scheduler", user = %principal.user_id, active, limit, "monitor cap reached");
            return Err(MonitorError::QuotaExceeded { active, limit });
        }

        let now = Utc::now();
        let task = MonitorTask::new(
            principal.user_id.clone(),
            query,
            price_threshold,
            check_interval_secs,
            channels,
            now,
        );
        let task = self.inner.store.insert_monitor(task).await?;
        self.inner.enqueue(task.next_check_at, task.id);
        info!(target: "scheduler", monitor = task.id, user = %task.user_id, "monitor created");
        Ok(task)
    }

    /// Stops all further checks. Deactivating twice is fine.
    pub async fn deactivate_monitor(
        &self,
        principal: &Principal,
        id: u64,
    ) -> Result<MonitorTask, MonitorError> {
        loop {
            let mut task = self.owned(principal, id).await?;
            let seen = task.status;
            if seen == MonitorStatus::Deactivated {
                return Ok(task);
            }
            task.status = MonitorStatus::Deactivated;
            if self.inner.store.save_monitor_if(&task, seen).await? {
                info!(target: "scheduler", monitor = id, was = seen.as_str(), "monitor deactivated");
                return Ok(task);
            }
        }
    }

    /// Suspended → Active with a clean failure counter and an immediate check.
    pub async fn reactivate_monitor(
        &self,
        principal: &Principal,
        id: u64,
    ) -> Result<MonitorTask, MonitorError> {
        let mut task = self.owned(principal, id).await?;
        if task.status != MonitorStatus::Suspended {
            return Err(MonitorError::Invalid(format!(
                "monitor {id} is {}, only suspended monitors can be reactivated",
                task.status.as_str()
            )));
        }
        let now = Utc::now();
        task.status = MonitorStatus::Active;
        task.consecutive_failures = 0;
        task.last_error = None;
        task.next_check_at = now;
        if !self
            .inner
            .store
            .save_monitor_if(&task, MonitorStatus::Suspended)
            .await?
        {
            return Err(MonitorError::Invalid(format!(
                "monitor {id} changed while reactivating, try again"
            )));
        }
        self.inner.enqueue(now, id);
        info!(target: "scheduler", monitor = id, "monitor reactivated");
        Ok(task)
    }

    pub async fn get_monitor(
        &self,
        principal: &Principal,
        id: u64,
    ) -> Result<MonitorTask, MonitorError> {
        self.owned(principal, id).await
    }

    async fn owned(&self, principal: &Principal, id: u64) -> Result<MonitorTask, MonitorError> {
        match self.inner.store.get_monitor(id).await? {
            Some(t) if principal.is_admin || t.user_id == principal.user_id => Ok(t),
            _ => Err(MonitorError::NotFound(id)),
        }
    }

    /// Takes the monitor's lease unless a live one exists.
    pub fn try_lease(&self, id: u64) -> Option<Uuid> {
        self.inner.try_lease(id)
    }

    pub fn release_lease(&self, id: u64, token: Uuid) {
        self.inner.release(id, token)
    }

    /// Runs one check under the monitor's lease.
    pub async fn run_check(&self, id: u64) -> Result<CheckOutcome, MonitorError> {
        let Some(token) = self.inner.try_lease(id) else {
            counter!("monitor_checks_total", "outcome" => "skipped").increment(1);
            debug!(target: "scheduler", monitor = id, "lease held elsewhere");
            return Ok(CheckOutcome::Skipped);
        };
        let res = self.inner.check(id, token).await;
        self.inner.release(id, token);
        match &res {
            Ok(o) => {
                counter!("monitor_checks_total", "outcome" => o.label()).increment(1);
            }
            Err(e) => {
                counter!("monitor_checks_total", "outcome" => "error").increment(1);
                warn!(target: "scheduler", monitor = id, error = %e, "check aborted");
            }
        }
        res
    }

    /// Pops every due monitor and starts its check on the worker pool.
    /// Returns how many checks were started.
    pub fn tick(&self) -> usize {
        let due = self.inner.pop_due(Utc::now());
        for &id in &due {
            let this = self.clone();
            tokio::spawn(async move {
                let Ok(_permit) = this.inner.permits.clone().acquire_owned().await else {
                    return;
                };
                if let Err(e) = this.run_check(id).await {
                    // store error: retry after the minimum interval
                    this.inner.enqueue(
                        Utc::now() + chrono::Duration::seconds(this.inner.cfg.min_interval_secs as i64),
                        id,
                    );
                    debug!(target: "scheduler", monitor = id, error = %e, "requeued after error");
                }
            });
        }
        due.len()
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.cfg.tick);
            loop {
                ticker.tick().await;
                let n = this.tick();
                if n > 0 {
                    trace!(target: "scheduler", started = n, "tick");
                }
            }
        })
    }

    /// Monitors waiting in the ready queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl Inner {
    fn enqueue(&self, at: DateTime<Utc>, id: u64) {
        self.queue.lock().push(Reverse((at, id)));
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Vec<u64> {
        let mut q = self.queue.lock();
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = q.peek().copied() {
            if at > now {
                break;
            }
            q.pop();
            if !due.contains(&id) {
                due.push(id);
            }
        }
        due
    }

    fn try_lease(&self, id: u64) -> Option<Uuid> {
        let now = Instant::now();
        let mut g = self.leases.lock();
        if let Some(l) = g.get(&id) {
            if l.expires_at > now {
                return None;
            }
            warn!(target: "scheduler", monitor = id, "lease expired, taking over");
        }
        let token = Uuid::new_v4();
        g.insert(
            id,
            Lease {
                token,
                expires_at: now + self.cfg.lease_ttl,
            },
        );
        Some(token)
    }

    /// True until another worker takes the lease over.
    fn holds(&self, id: u64, token: Uuid) -> bool {
        self.leases
            .lock()
            .get(&id)
            .is_some_and(|l| l.token == token)
    }

    fn release(&self, id: u64, token: Uuid) {
        let mut g = self.leases.lock();
        if g.get(&id).is_some_and(|l| l.token == token) {
            g.remove(&id);
        }
    }

    async fn check(&self, id: u64, token: Uuid) -> Result<CheckOutcome, MonitorError> {
        let now = Utc::now();
        let mut task = self
            .store
            .get_monitor(id)
            .await?
            .ok_or(MonitorError::NotFound(id))?;
        if !task.is_active() || task.next_check_at > now {
            return Ok(CheckOutcome::Skipped);
        }
        let seen = task.status;
        if task.is_expired(now.date_naive()) {
            task.status = MonitorStatus::Deactivated;
            if !self.store.save_monitor_if(&task, seen).await? {
                return Ok(CheckOutcome::Skipped);
            }
            info!(target: "scheduler", monitor = id, depart = %task.query.depart_date(), "departure passed, monitor deactivated");
            return Ok(CheckOutcome::Expired);
        }

        task.status = MonitorStatus::Checking;
        if !self.store.save_monitor_if(&task, seen).await? {
            return Ok(CheckOutcome::Skipped);
        }

        let searched = self.aggregator.search(&task.query, &CancelToken::new()).await;

        if !self.holds(id, token) {
            warn!(target: "scheduler", monitor = id, "lease lost during check, dropping result");
            return Ok(CheckOutcome::Skipped);
        }
        // The user may have deactivated the monitor while the search ran.
        match self.store.get_monitor(id).await? {
            Some(current) if current.status == MonitorStatus::Checking => {}
            _ => return Ok(CheckOutcome::Skipped),
        }

        let now = Utc::now();
        let outcome = match searched {
            Ok(result) => self.on_success(&mut task, &result, now).await,
            Err(e) => self.on_failure(&mut task, e.to_string()).await,
        };
        if task.status == MonitorStatus::Active {
            task.next_check_at = now + task.check_interval();
        }
        if !self
            .store
            .save_monitor_if(&task, MonitorStatus::Checking)
            .await?
        {
            info!(target: "scheduler", monitor = id, "monitor changed during check, result dropped");
            return Ok(CheckOutcome::Skipped);
        }
        if task.status == MonitorStatus::Active {
            self.enqueue(task.next_check_at, id);
        }
        Ok(outcome)
    }

    async fn on_success(
        &self,
        task: &mut MonitorTask,
        result: &AggregatedResult,
        now: DateTime<Utc>,
    ) -> CheckOutcome {
        task.status = MonitorStatus::Active;
        task.consecutive_failures = 0;
        task.last_error = None;
        task.last_check_at = Some(now);

        let price = result.cheapest().map(|f| f.price);
        let mut alerted = 0;
        let mut undelivered = 0;
        if let Some(p) = price {
            if task.is_price_drop(p) {
                if self.anti_flutter.should_alert(task.last_alert.as_ref(), p, now) {
                    let payload = render::price_drop(task, result, p);
                    let key = idempotency_key(task.id, p, self.cfg.price_bucket, now.date_naive());
                    (alerted, undelivered) = self.dispatch(task, &payload, &key).await;
                    if alerted > 0 && undelivered == 0 {
                        task.last_alert = Some(AlertMark { price: p, at: now });
                    }
                } else {
                    debug!(target: "scheduler", monitor = task.id, price = p, "alert held back by cooldown");
                }
            }
            // An alert some channel never got keeps the old price so the next check retries it.
            if undelivered == 0 {
                task.last_known_price = Some(p);
            } else {
                debug!(target: "scheduler", monitor = task.id, price = p, undelivered, "alert not delivered, will retry");
            }
        }
        debug!(target: "scheduler", monitor = task.id, price = ?price, alerted, "check ok");
        CheckOutcome::Checked { price, alerted }
    }

    async fn on_failure(&self, task: &mut MonitorTask, error: String) -> CheckOutcome {
        task.consecutive_failures += 1;
        task.last_error = Some(error);
        if task.consecutive_failures < self.cfg.failure_threshold {
            task.status = MonitorStatus::Active;
            debug!(target: "scheduler", monitor = task.id, failures = task.consecutive_failures, "check failed");
            return CheckOutcome::Failed {
                failures: task.consecutive_failures,
            };
        }

        task.status = MonitorStatus::Suspended;
        task.suspension_count += 1;
        counter!("monitor_suspended_total").increment(1);
        warn!(target: "scheduler", monitor = task.id, failures = task.consecutive_failures, "monitor suspended");
        let payload = render::degraded(
            task,
            task.consecutive_failures,
            task.last_error.as_deref().unwrap_or("unknown"),
        );
        let key = format!("monitor:{}:degraded:{}", task.id, task.suspension_count);
        self.dispatch(task, &payload, &key).await;
        CheckOutcome::Suspended
    }

    /// Sends to every channel of the monitor and returns `(sent, failed)`. Failures end
    /// up on the task, never in the check result.
    async fn dispatch(
        &self,
        task: &mut MonitorTask,
        payload: &NotificationPayload,
        key: &str,
    ) -> (usize, usize) {
        let mut sent = 0;
        let mut errors = Vec::new();
        for target in &task.notification_channels {
            match self.dispatcher.send(task.id, target, payload, key).await {
                Ok(SendOutcome::Sent) => sent += 1,
                Ok(SendOutcome::Duplicate) => {}
                Err(e) => errors.push(format!("{}: {e}", target.channel.as_str())),
            }
        }
        task.last_notify_error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };
        (sent, errors.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        assert_eq!(CheckOutcome::Checked { price: None, alerted: 0 }.label(), "ok");
        assert_eq!(CheckOutcome::Checked { price: Some(1.0), alerted: 2 }.label(), "alerted");
        assert_eq!(CheckOutcome::Failed { failures: 1 }.label(), "failed");
    }
}
