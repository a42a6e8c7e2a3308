//! Notification delivery: channel senders, idempotent dispatch with retry/backoff.

pub mod antiflutter;
pub mod email;
pub mod push;
pub mod render;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NotifyError;
use crate::store::{Claim, NotificationLog};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "notify_attempts_total",
            "Delivery attempts by channel and outcome (sent, retry, failed, duplicate)."
        );
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Push,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }
}

/// A channel plus the address on it (mailbox, push token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTarget {
    pub channel: Channel,
    pub recipient: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub monitor_task_id: u64,
    pub idempotency_key: String,
    pub channel: Channel,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    /// Completed send rounds (one per `finish`).
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PriceDrop,
    MonitorDegraded,
}

/// Rendered message, ready for any channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub kind: NotificationKind,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Key unique per (monitor, price bucket, day).
pub fn idempotency_key(monitor_id: u64, price: f64, bucket: f64, day: NaiveDate) -> String {
    let bucket = if bucket > 0.0 { bucket } else { 1.0 };
    format!(
        "monitor:{monitor_id}:price:{}:{}",
        (price / bucket).floor() as i64,
        day.format("%Y%m%d")
    )
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// One delivery attempt. `InvalidRecipient` is permanent; anything else may be retried.
    async fn deliver(&self, recipient: &str, payload: &NotificationPayload)
        -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub max_attempts: u8,
    pub base_backoff: Duration,
    pub send_timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            send_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// A record for this key already exists; nothing was sent.
    Duplicate,
}

pub struct NotificationDispatcher {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    log: Arc<dyn NotificationLog>,
    cfg: NotifyConfig,
}

impl NotificationDispatcher {
    pub fn new(log: Arc<dyn NotificationLog>, cfg: NotifyConfig) -> Self {
        ensure_metrics_described();
        Self {
            senders: HashMap::new(),
            log,
            cfg,
        }
    }

    pub fn with_sender(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.senders.contains_key(&channel)
    }

    /// Claims `idempotency_key` for the target channel, then delivers with retries.
    /// A key that already has a record short-circuits to `Duplicate`.
    pub async fn send(
        &self,
        monitor_task_id: u64,
        target: &ChannelTarget,
        payload: &NotificationPayload,
        idempotency_key: &str,
    ) -> Result<SendOutcome, NotifyError> {
        let channel = target.channel;
        let claim = self
            .log
            .claim(NotificationRecord {
                monitor_task_id,
                idempotency_key: idempotency_key.to_string(),
                channel,
                sent_at: None,
                status: DeliveryStatus::Sending,
                attempts: 0,
                error: None,
            })
            .await?;
        if let Claim::Exists(rec) = claim {
            counter!("notify_attempts_total", "channel" => channel.as_str(), "outcome" => "duplicate")
                .increment(1);
            debug!(target: "notify", key = idempotency_key, status = ?rec.status, "duplicate suppressed");
            return Ok(SendOutcome::Duplicate);
        }

        let result = self.deliver_with_retry(target, payload).await;
        match &result {
            Ok(()) => {
                self.log
                    .finish(idempotency_key, channel, DeliveryStatus::Sent, Some(Utc::now()), None)
                    .await?;
                info!(target: "notify", monitor = monitor_task_id, channel = channel.as_str(), "notification sent");
            }
            Err(e) => {
                self.log
                    .finish(
                        idempotency_key,
                        channel,
                        DeliveryStatus::Failed,
                        None,
                        Some(e.to_string()),
                    )
                    .await?;
                warn!(target: "notify", monitor = monitor_task_id, channel = channel.as_str(), error = %e, "notification failed");
            }
        }
        result.map(|()| SendOutcome::Sent)
    }

    async fn deliver_with_retry(
        &self,
        target: &ChannelTarget,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let channel = target.channel;
        let Some(sender) = self.senders.get(&channel) else {
            counter!("notify_attempts_total", "channel" => channel.as_str(), "outcome" => "failed")
                .increment(1);
            return Err(NotifyError::ChannelUnavailable(format!(
                "no {} sender configured",
                channel.as_str()
            )));
        };

        let max = self.cfg.max_attempts.max(1);
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = match tokio::time::timeout(
                self.cfg.send_timeout,
                sender.deliver(&target.recipient, payload),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(NotifyError::ChannelUnavailable(format!(
                    "send timed out after {}ms",
                    self.cfg.send_timeout.as_millis()
                ))),
            };

            match res {
                Ok(()) => {
                    counter!("notify_attempts_total", "channel" => channel.as_str(), "outcome" => "sent")
                        .increment(1);
                    return Ok(());
                }
                Err(e @ NotifyError::InvalidRecipient(_)) => {
                    counter!("notify_attempts_total", "channel" => channel.as_str(), "outcome" => "failed")
                        .increment(1);
                    return Err(e);
                }
                Err(e) if attempt < max => {
                    counter!("notify_attempts_total", "channel" => channel.as_str(), "outcome" => "retry")
                        .increment(1);
                    debug!(target: "notify", attempt, error = %e, "delivery failed, backing off");
                    tokio::time::sleep(self.cfg.base_backoff * (1u32 << (attempt - 1))).await;
                }
                Err(e) => {
                    counter!("notify_attempts_total", "channel" => channel.as_str(), "outcome" => "failed")
                        .increment(1);
                    return Err(e);
                }
            }
        }
    }
}
