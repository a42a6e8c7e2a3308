//! Persistence seams: usage counters, monitor tasks and notification records.
//!
//! The durable store is an external collaborator; these traits are the whole contract
//! the core relies on. `MemoryStore` backs the binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::monitor::{MonitorStatus, MonitorTask};
use crate::notify::{Channel, DeliveryStatus, NotificationRecord};
use crate::quota::{Metric, Window};

/// `(user_id, metric, time_window, period_start)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    pub user_id: String,
    pub metric: Metric,
    pub window: Window,
    pub period_start: NaiveDate,
}

impl UsageKey {
    /// Flat key in the `quota:{user}:{metric}:{period}` layout used by key-value stores.
    pub fn storage_key(&self) -> String {
        format!(
            "quota:{}:{}:{}:{}",
            self.user_id,
            self.metric.as_str(),
            self.window.as_str(),
            self.period_start
        )
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Atomically increments the counter if it is below `limit`.
    /// Returns the new count, or `None` when the limit was already reached.
    async fn increment_if_below(&self, key: &UsageKey, limit: u64)
        -> Result<Option<u64>, StoreError>;

    async fn usage(&self, key: &UsageKey) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Persists a new task and returns it with its assigned id.
    async fn insert_monitor(&self, task: MonitorTask) -> Result<MonitorTask, StoreError>;
    async fn get_monitor(&self, id: u64) -> Result<Option<MonitorTask>, StoreError>;
    async fn save_monitor(&self, task: &MonitorTask) -> Result<(), StoreError>;
    /// Writes `task` only if the stored copy is still in status `expected`, atomically.
    /// Returns false and writes nothing otherwise, including when the task is gone.
    async fn save_monitor_if(
        &self,
        task: &MonitorTask,
        expected: MonitorStatus,
    ) -> Result<bool, StoreError>;
    /// Every task that still needs scheduling (`Active` or `Checking`).
    async fn list_schedulable(&self) -> Result<Vec<MonitorTask>, StoreError>;
    /// Tasks occupying one of the user's monitor slots (anything not deactivated).
    async fn count_active(&self, user_id: &str) -> Result<u64, StoreError>;
}

/// Outcome of trying to reserve an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Caller owns the key and must finish the record.
    Claimed,
    /// A record already exists (sent, or being sent by someone else).
    Exists(NotificationRecord),
}

#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Inserts a `Sending` record unless one exists for `(idempotency_key, channel)`.
    /// A `Failed` record is re-claimed in place.
    async fn claim(&self, record: NotificationRecord) -> Result<Claim, StoreError>;

    async fn finish(
        &self,
        idempotency_key: &str,
        channel: Channel,
        status: DeliveryStatus,
        sent_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn records_for(&self, monitor_task_id: u64)
        -> Result<Vec<NotificationRecord>, StoreError>;
}

/// In-process store. Each map has its own lock; no lock is held across an await.
#[derive(Default)]
pub struct MemoryStore {
    usage: Mutex<HashMap<UsageKey, u64>>,
    monitors: Mutex<BTreeMap<u64, MonitorTask>>,
    next_monitor_id: AtomicU64,
    notifications: Mutex<HashMap<(String, Channel), NotificationRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `StoreError::Unavailable` until cleared.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn increment_if_below(
        &self,
        key: &UsageKey,
        limit: u64,
    ) -> Result<Option<u64>, StoreError> {
        self.check()?;
        let mut g = self.usage.lock();
        let n = g.entry(key.clone()).or_insert(0);
        if *n >= limit {
            return Ok(None);
        }
        *n += 1;
        Ok(Some(*n))
    }

    async fn usage(&self, key: &UsageKey) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.usage.lock().get(key).copied().unwrap_or(0))
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn insert_monitor(&self, mut task: MonitorTask) -> Result<MonitorTask, StoreError> {
        self.check()?;
        task.id = self.next_monitor_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.monitors.lock().insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_monitor(&self, id: u64) -> Result<Option<MonitorTask>, StoreError> {
        self.check()?;
        Ok(self.monitors.lock().get(&id).cloned())
    }

    async fn save_monitor(&self, task: &MonitorTask) -> Result<(), StoreError> {
        self.check()?;
        self.monitors.lock().insert(task.id, task.clone());
        Ok(())
    }

    async fn save_monitor_if(
        &self,
        task: &MonitorTask,
        expected: MonitorStatus,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut g = self.monitors.lock();
        match g.get_mut(&task.id) {
            Some(current) if current.status == expected => {
                *current = task.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_schedulable(&self) -> Result<Vec<MonitorTask>, StoreError> {
        self.check()?;
        Ok(self
            .monitors
            .lock()
            .values()
            .filter(|t| matches!(t.status, MonitorStatus::Active | MonitorStatus::Checking))
            .cloned()
            .collect())
    }

    async fn count_active(&self, user_id: &str) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self
            .monitors
            .lock()
            .values()
            .filter(|t| t.user_id == user_id && t.status != MonitorStatus::Deactivated)
            .count() as u64)
    }
}

#[async_trait]
impl NotificationLog for MemoryStore {
    async fn claim(&self, record: NotificationRecord) -> Result<Claim, StoreError> {
        self.check()?;
        let mut g = self.notifications.lock();
        let key = (record.idempotency_key.clone(), record.channel);
        match g.get_mut(&key) {
            Some(existing) if existing.status == DeliveryStatus::Failed => {
                existing.status = DeliveryStatus::Sending;
                existing.error = None;
                Ok(Claim::Claimed)
            }
            Some(existing) => Ok(Claim::Exists(existing.clone())),
            None => {
                g.insert(key, record);
                Ok(Claim::Claimed)
            }
        }
    }

    async fn finish(
        &self,
        idempotency_key: &str,
        channel: Channel,
        status: DeliveryStatus,
        sent_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.notifications.lock();
        if let Some(rec) = g.get_mut(&(idempotency_key.to_string(), channel)) {
            rec.status = status;
            rec.sent_at = sent_at;
            rec.attempts += 1;
            rec.error = error;
        }
        Ok(())
    }

    async fn records_for(
        &self,
        monitor_task_id: u64,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        self.check()?;
        let mut out: Vec<_> = self
            .notifications
            .lock()
            .values()
            .filter(|r| r.monitor_task_id == monitor_task_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.idempotency_key.cmp(&b.idempotency_key));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> UsageKey {
        UsageKey {
            user_id: "u1".into(),
            metric: Metric::Search,
            window: Window::Daily,
            period_start: NaiveDate::from_ymd_opt(2025, 9, 15).unwrap(),
        }
    }

    #[tokio::test]
    async fn increment_stops_at_limit() {
        let s = MemoryStore::new();
        assert_eq!(s.increment_if_below(&key(), 2).await.unwrap(), Some(1));
        assert_eq!(s.increment_if_below(&key(), 2).await.unwrap(), Some(2));
        assert_eq!(s.increment_if_below(&key(), 2).await.unwrap(), None);
        assert_eq!(s.usage(&key()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn outage_surfaces_as_unavailable() {
        let s = MemoryStore::new();
        s.set_unavailable(true);
        let err = s.usage(&key()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        s.set_unavailable(false);
        assert_eq!(s.usage(&key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn conditional_save_only_writes_from_the_expected_status() {
        let s = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2025, 9, 15).unwrap();
        let q = crate::model::SearchQuery::one_way("SHA", "NYC", day);
        let mut t = s
            .insert_monitor(MonitorTask::new("u1", q, 3000.0, 3600, vec![], Utc::now()))
            .await
            .unwrap();

        let mut stopped = t.clone();
        stopped.status = MonitorStatus::Deactivated;
        assert!(s.save_monitor_if(&stopped, MonitorStatus::Active).await.unwrap());

        t.last_known_price = Some(2800.0);
        assert!(!s.save_monitor_if(&t, MonitorStatus::Active).await.unwrap());
        let stored = s.get_monitor(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MonitorStatus::Deactivated);
        assert_eq!(stored.last_known_price, None);

        t.id = 99;
        assert!(!s.save_monitor_if(&t, MonitorStatus::Active).await.unwrap());
    }

    #[test]
    fn storage_key_layout() {
        assert_eq!(key().storage_key(), "quota:u1:search:daily:2025-09-15");
    }
}
