// src/notify/antiflutter.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Last price alert sent for a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertMark {
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Cooldown gate against alert spam when a fare oscillates around the threshold.
/// - First alert always allowed.
/// - Inside cooldown, alerts are suppressed unless the price is strictly lower than
///   the last alerted price.
/// - State lives on the monitor and is updated after a successful send.
#[derive(Debug, Clone, Copy, Default)]
pub struct AntiFlutter {
    cooldown: ChronoDuration,
}

impl AntiFlutter {
    /// `cooldown_secs` < 0 is treated as 0 (no cooldown).
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.max(0)),
        }
    }

    /// Check if we may alert at `now` for `price`. Does NOT mutate state.
    pub fn should_alert(&self, last: Option<&AlertMark>, price: f64, now: DateTime<Utc>) -> bool {
        match last {
            None => true,
            Some(m) => now.signed_duration_since(m.at) >= self.cooldown || price < m.price,
        }
    }
}
