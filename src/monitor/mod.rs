//! Recurring price watches.

pub mod scheduler;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::SearchQuery;
use crate::notify::antiflutter::AlertMark;
use crate::notify::ChannelTarget;

pub use scheduler::{CheckOutcome, MonitorScheduler, SchedulerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Active,
    /// A worker holds the lease and a check is in flight.
    Checking,
    /// Too many consecutive failed checks; waits for the user to reactivate.
    Suspended,
    Deactivated,
}

impl MonitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorStatus::Active => "active",
            MonitorStatus::Checking => "checking",
            MonitorStatus::Suspended => "suspended",
            MonitorStatus::Deactivated => "deactivated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorTask {
    /// Assigned by the store on insert.
    pub id: u64,
    pub user_id: String,
    pub query: SearchQuery,
    pub price_threshold: f64,
    pub check_interval_secs: u64,
    pub last_check_at: Option<DateTime<Utc>>,
    /// Cheapest price of the last check. Held back while a price alert has not reached
    /// every channel, so the next check sees the same drop again.
    pub last_known_price: Option<f64>,
    pub next_check_at: DateTime<Utc>,
    pub status: MonitorStatus,
    pub consecutive_failures: u32,
    /// Bumped on every suspension; scopes the degraded notice key.
    pub suspension_count: u32,
    pub notification_channels: Vec<ChannelTarget>,
    pub last_alert: Option<AlertMark>,
    pub last_error: Option<String>,
    pub last_notify_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MonitorTask {
    pub fn new(
        user_id: impl Into<String>,
        query: SearchQuery,
        price_threshold: f64,
        check_interval_secs: u64,
        notification_channels: Vec<ChannelTarget>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            user_id: user_id.into(),
            query,
            price_threshold,
            check_interval_secs,
            last_check_at: None,
            last_known_price: None,
            next_check_at: now,
            status: MonitorStatus::Active,
            consecutive_failures: 0,
            suspension_count: 0,
            notification_channels,
            last_alert: None,
            last_error: None,
            last_notify_error: None,
            created_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, MonitorStatus::Active | MonitorStatus::Checking)
    }

    /// Departure already behind us: nothing left to watch.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.query.depart_date() < today
    }

    pub fn check_interval(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.check_interval_secs as i64)
    }

    /// Whether `price` is a drop worth telling the user about.
    pub fn is_price_drop(&self, price: f64) -> bool {
        price < self.price_threshold && self.last_known_price.map_or(true, |last| price < last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(last: Option<f64>) -> MonitorTask {
        let q = SearchQuery::one_way("SHA", "NYC", NaiveDate::from_ymd_opt(2025, 9, 15).unwrap());
        let mut t = MonitorTask::new("u1", q, 3000.0, 3600, vec![], Utc::now());
        t.last_known_price = last;
        t
    }

    #[test]
    fn drop_needs_threshold_and_lower_than_last() {
        assert!(task(Some(3500.0)).is_price_drop(2800.0));
        assert!(task(None).is_price_drop(2800.0));
        assert!(!task(Some(2700.0)).is_price_drop(2800.0));
        assert!(!task(Some(3500.0)).is_price_drop(3100.0));
        assert!(!task(Some(3500.0)).is_price_drop(3000.0));
    }

    #[test]
    fn expiry_follows_departure_date() {
        let t = task(None);
        assert!(!t.is_expired(NaiveDate::from_ymd_opt(2025, 9, 15).unwrap()));
        assert!(t.is_expired(NaiveDate::from_ymd_opt(2025, 9, 16).unwrap()));
    }
}
