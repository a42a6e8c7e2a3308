//! Outward surface of the core: one-shot searches, monitors and quota lookups,
//! wired from config. Callers hand in an already authenticated `Principal`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::cache::ResultCache;
use crate::config::AppConfig;
use crate::error::{MonitorError, QuotaError, TaskError};
use crate::model::SearchQuery;
use crate::monitor::{MonitorScheduler, MonitorTask};
use crate::notify::email::EmailSender;
use crate::notify::push::PushSender;
use crate::notify::{ChannelSender, ChannelTarget, NotificationDispatcher};
use crate::quota::{Metric, Principal, QuotaEnforcer, QuotaStatus, Window};
use crate::sources::ai_reasoning::AiReasoningAdapter;
use crate::sources::fare_engine::FareEngineAdapter;
use crate::sources::hidden_route::HiddenRouteAdapter;
use crate::sources::SourceRegistry;
use crate::store::{MonitorStore, NotificationLog, UsageStore};
use crate::tasks::{AsyncTask, TaskManager, TaskState};

/// Persistence seams the core runs against.
#[derive(Clone)]
pub struct Stores {
    pub usage: Arc<dyn UsageStore>,
    pub monitors: Arc<dyn MonitorStore>,
    pub notifications: Arc<dyn NotificationLog>,
}

pub struct FareRadar {
    aggregator: Arc<Aggregator>,
    quota: Arc<QuotaEnforcer>,
    tasks: TaskManager,
    scheduler: MonitorScheduler,
}

/// Adapters for every source that has a URL (or, for the AI stage, is enabled).
pub fn registry_from_config(cfg: &AppConfig) -> Result<SourceRegistry> {
    let mut reg = SourceRegistry::new();
    if let Some(url) = &cfg.sources.fare_engine_url {
        let a = FareEngineAdapter::from_url(url, cfg.sources.fare_engine_api_key.clone())?;
        reg = reg.with_primary(Arc::new(a));
    }
    if let Some(url) = &cfg.sources.hidden_route_url {
        let mut a = HiddenRouteAdapter::from_url(url)?;
        if !cfg.sources.hidden_city {
            a = a.without_hidden_city();
        }
        reg = reg.with_alternate(Arc::new(a));
    }
    if cfg.ai.enabled {
        let a = AiReasoningAdapter::from_config(&cfg.ai).context("building AI adapter")?;
        reg = reg.with_reasoning(Arc::new(a));
    }
    Ok(reg)
}

pub fn senders_from_config(cfg: &AppConfig) -> Result<Vec<Arc<dyn ChannelSender>>> {
    let mut out: Vec<Arc<dyn ChannelSender>> = Vec::new();
    if let Some(smtp) = &cfg.smtp {
        out.push(Arc::new(EmailSender::from_config(smtp)?));
    }
    if let Some(endpoint) = &cfg.notify.push_endpoint {
        out.push(Arc::new(PushSender::new(endpoint)?));
    }
    Ok(out)
}

impl FareRadar {
    /// Builds every component and starts the task workers on the current runtime.
    pub fn build(
        cfg: &AppConfig,
        registry: SourceRegistry,
        senders: Vec<Arc<dyn ChannelSender>>,
        stores: Stores,
    ) -> Result<Self> {
        if registry.is_empty() {
            warn!(target: "aggregator", "no flight sources configured; every search will fail");
        }
        let cache = Arc::new(ResultCache::new(cfg.cache_ttl(), cfg.pipeline_timeout()));
        let aggregator = Arc::new(Aggregator::new(registry, cache, cfg.aggregator_config()));
        let quota = Arc::new(QuotaEnforcer::new(
            stores.usage.clone(),
            stores.monitors.clone(),
            cfg.quota_limits()?,
        ));

        let mut dispatcher = NotificationDispatcher::new(stores.notifications, cfg.notify_config());
        for s in senders {
            debug!(target: "notify", channel = s.channel().as_str(), "channel enabled");
            dispatcher = dispatcher.with_sender(s);
        }

        let tasks = TaskManager::start(aggregator.clone(), quota.clone(), cfg.task_config());
        let scheduler = MonitorScheduler::new(
            stores.monitors,
            aggregator.clone(),
            Arc::new(dispatcher),
            quota.clone(),
            cfg.scheduler_config(),
        );
        Ok(Self {
            aggregator,
            quota,
            tasks,
            scheduler,
        })
    }

    /// `build` with adapters and channel senders taken from config.
    pub fn from_config(cfg: &AppConfig, stores: Stores) -> Result<Self> {
        let registry = registry_from_config(cfg)?;
        let senders = senders_from_config(cfg)?;
        Self::build(cfg, registry, senders, stores)
    }

    /// Loads persisted monitors and starts the scheduler, task GC and cache purge loops.
    pub async fn start_background(&self) -> Result<Vec<JoinHandle<()>>> {
        let n = self.scheduler.load().await.context("loading monitors")?;
        info!(target: "scheduler", monitors = n, "scheduler starting");

        let cache = self.aggregator.cache().clone();
        let purge = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let n = cache.purge_expired();
                if n > 0 {
                    debug!(target: "cache", purged = n, "expired entries dropped");
                }
            }
        });
        Ok(vec![self.scheduler.spawn(), self.tasks.spawn_gc(), purge])
    }

    pub async fn submit_search(
        &self,
        principal: &Principal,
        query: SearchQuery,
    ) -> Result<Uuid, TaskError> {
        self.tasks.submit(principal, query).await
    }

    /// Another user's task reads as not found.
    pub fn poll_search(&self, principal: &Principal, id: Uuid) -> Result<AsyncTask, TaskError> {
        let task = self.tasks.poll(id)?;
        if !principal.is_admin && task.user_id != principal.user_id {
            return Err(TaskError::NotFound(id.to_string()));
        }
        Ok(task)
    }

    pub fn cancel_search(&self, principal: &Principal, id: Uuid) -> Result<TaskState, TaskError> {
        self.poll_search(principal, id)?;
        self.tasks.cancel(id)
    }

    pub async fn create_monitor(
        &self,
        principal: &Principal,
        query: SearchQuery,
        price_threshold: f64,
        check_interval_secs: u64,
        channels: Vec<ChannelTarget>,
    ) -> Result<MonitorTask, MonitorError> {
        self.scheduler
            .create_monitor(principal, query, price_threshold, check_interval_secs, channels)
            .await
    }

    pub async fn deactivate_monitor(
        &self,
        principal: &Principal,
        id: u64,
    ) -> Result<MonitorTask, MonitorError> {
        self.scheduler.deactivate_monitor(principal, id).await
    }

    pub async fn reactivate_monitor(
        &self,
        principal: &Principal,
        id: u64,
    ) -> Result<MonitorTask, MonitorError> {
        self.scheduler.reactivate_monitor(principal, id).await
    }

    pub async fn get_monitor(
        &self,
        principal: &Principal,
        id: u64,
    ) -> Result<MonitorTask, MonitorError> {
        self.scheduler.get_monitor(principal, id).await
    }

    pub async fn quota_status(
        &self,
        principal: &Principal,
        metric: Metric,
        window: Window,
    ) -> Result<QuotaStatus, QuotaError> {
        self.quota.quota_status(principal, metric, window).await
    }

    pub fn scheduler(&self) -> &MonitorScheduler {
        &self.scheduler
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }
}
