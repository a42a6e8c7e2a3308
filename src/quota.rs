//! Per-user usage limits by tier, metric and time window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;
use crate::store::{MonitorStore, UsageKey, UsageStore};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "quota_rejections_total",
            "Operations refused because the user's quota was exhausted."
        );
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Guest,
    User,
    Plus,
    Pro,
    Max,
    Vip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Search,
    AiSearch,
    Monitor,
    Export,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Search => "search",
            Metric::AiSearch => "ai_search",
            Metric::Monitor => "monitor",
            Metric::Export => "export",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Daily,
    Monthly,
}

impl Window {
    pub fn as_str(self) -> &'static str {
        match self {
            Window::Daily => "daily",
            Window::Monthly => "monthly",
        }
    }

    /// `now` truncated to the window boundary (UTC).
    pub fn period_start(self, now: DateTime<Utc>) -> NaiveDate {
        let d = now.date_naive();
        match self {
            Window::Daily => d,
            Window::Monthly => d.with_day(1).unwrap_or(d),
        }
    }

    /// First instant of the next period.
    pub fn resets_at(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.period_start(now);
        let next = match self {
            Window::Daily => start + ChronoDuration::days(1),
            Window::Monthly => {
                let (y, m) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(start + ChronoDuration::days(31))
            }
        };
        Utc.from_utc_datetime(&next.and_time(chrono::NaiveTime::default()))
    }
}

/// Identity handed over by the auth collaborator; trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub tier: Tier,
    #[serde(default)]
    pub is_admin: bool,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            user_id: user_id.into(),
            tier,
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: Tier::Vip,
            is_admin: true,
        }
    }
}

/// Limit table: tier → metric → count. `-1` is unlimited; a missing metric is `0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaLimits(HashMap<Tier, HashMap<Metric, i64>>);

impl Default for QuotaLimits {
    fn default() -> Self {
        use Metric::*;
        let row = |s: i64, a: i64, m: i64, e: i64| {
            HashMap::from([(Search, s), (AiSearch, a), (Monitor, m), (Export, e)])
        };
        Self(HashMap::from([
            (Tier::Guest, row(10, 0, 0, 0)),
            (Tier::User, row(50, 0, 0, 0)),
            (Tier::Plus, row(200, 50, 10, 20)),
            (Tier::Pro, row(500, 200, 50, 100)),
            (Tier::Max, row(-1, -1, -1, -1)),
            (Tier::Vip, row(-1, -1, -1, -1)),
        ]))
    }
}

impl QuotaLimits {
    pub fn limit(&self, tier: Tier, metric: Metric) -> i64 {
        self.0
            .get(&tier)
            .and_then(|m| m.get(&metric))
            .copied()
            .unwrap_or(0)
    }

    pub fn set(&mut self, tier: Tier, metric: Metric, limit: i64) {
        self.0.entry(tier).or_default().insert(metric, limit);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub metric: Metric,
    pub window: Window,
    /// `-1` when unlimited.
    pub limit: i64,
    pub used: u64,
    /// `-1` when unlimited.
    pub remaining: i64,
    pub unlimited: bool,
    pub period_start: NaiveDate,
    pub resets_at: DateTime<Utc>,
}

pub struct QuotaEnforcer {
    usage: Arc<dyn UsageStore>,
    monitors: Arc<dyn MonitorStore>,
    limits: QuotaLimits,
}

impl QuotaEnforcer {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        monitors: Arc<dyn MonitorStore>,
        limits: QuotaLimits,
    ) -> Self {
        ensure_metrics_described();
        Self {
            usage,
            monitors,
            limits,
        }
    }

    /// `None` means unlimited.
    pub fn limit_for(&self, principal: &Principal, metric: Metric) -> Option<u64> {
        if principal.is_admin {
            return None;
        }
        u64::try_from(self.limits.limit(principal.tier, metric)).ok()
    }

    /// Atomically consumes one unit of `metric` in the current `window`.
    /// `Ok(false)` means the caller must refuse the operation.
    pub async fn check_and_increment(
        &self,
        principal: &Principal,
        metric: Metric,
        window: Window,
    ) -> Result<bool, QuotaError> {
        self.check_and_increment_at(principal, metric, window, Utc::now())
            .await
    }

    pub async fn check_and_increment_at(
        &self,
        principal: &Principal,
        metric: Metric,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        let Some(limit) = self.limit_for(principal, metric) else {
            return Ok(true);
        };
        let allowed = limit > 0
            && self
                .usage
                .increment_if_below(&self.key(principal, metric, window, now), limit)
                .await?
                .is_some();
        if !allowed {
            counter!("quota_rejections_total", "metric" => metric.as_str()).increment(1);
            tracing::info!(target: "quota", user = %principal.user_id, metric = metric.as_str(), limit, "quota exhausted");
        }
        Ok(allowed)
    }

    /// Non-windowed occupancy, e.g. simultaneous monitors. Metrics without an
    /// occupancy notion report zero.
    pub async fn count_active(&self, user_id: &str, metric: Metric) -> Result<u64, QuotaError> {
        match metric {
            Metric::Monitor => Ok(self.monitors.count_active(user_id).await?),
            _ => Ok(0),
        }
    }

    /// Whether one more active `metric` item fits under the user's cap.
    pub async fn has_capacity(
        &self,
        principal: &Principal,
        metric: Metric,
    ) -> Result<(bool, u64, Option<u64>), QuotaError> {
        let limit = self.limit_for(principal, metric);
        let active = self.count_active(&principal.user_id, metric).await?;
        Ok((limit.map_or(true, |l| active < l), active, limit))
    }

    pub async fn quota_status(
        &self,
        principal: &Principal,
        metric: Metric,
        window: Window,
    ) -> Result<QuotaStatus, QuotaError> {
        let now = Utc::now();
        let period_start = window.period_start(now);
        let resets_at = window.resets_at(now);
        let Some(limit) = self.limit_for(principal, metric) else {
            return Ok(QuotaStatus {
                metric,
                window,
                limit: -1,
                used: 0,
                remaining: -1,
                unlimited: true,
                period_start,
                resets_at,
            });
        };
        let used = self
            .usage
            .usage(&self.key(principal, metric, window, now))
            .await?;
        Ok(QuotaStatus {
            metric,
            window,
            limit: limit as i64,
            used,
            remaining: limit.saturating_sub(used) as i64,
            unlimited: false,
            period_start,
            resets_at,
        })
    }

    fn key(
        &self,
        principal: &Principal,
        metric: Metric,
        window: Window,
        now: DateTime<Utc>,
    ) -> UsageKey {
        UsageKey {
            user_id: principal.user_id.clone(),
            metric,
            window,
            period_start: window.period_start(now),
        }
    }
}
