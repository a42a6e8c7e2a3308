//! Application config: one TOML file, every field defaulted, secrets from env.
//!
//! Lookup order for the file:
//! 1) $FARE_RADAR_CONFIG
//! 2) config/fare_radar.toml
//! 3) built-in defaults

pub mod ai;

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::monitor::SchedulerConfig;
use crate::notify::NotifyConfig;
use crate::quota::{Metric, QuotaLimits, Tier};
use crate::tasks::TaskManagerConfig;

use self::ai::AiConfig;

const ENV_PATH: &str = "FARE_RADAR_CONFIG";
const DEFAULT_PATH: &str = "config/fare_radar.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesSection {
    pub fare_engine_url: Option<String>,
    /// "ENV" means: read from FARE_ENGINE_API_KEY
    pub fare_engine_api_key: Option<String>,
    pub hidden_route_url: Option<String>,
    /// Ask the alternate engine for throw-away (hidden-city) itineraries.
    pub hidden_city: bool,
    pub timeout_ms: u64,
    pub reasoning_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub rate_limit_cooldown_secs: u64,
}

impl Default for SourcesSection {
    fn default() -> Self {
        Self {
            fare_engine_url: None,
            fare_engine_api_key: None,
            hidden_route_url: None,
            hidden_city: true,
            timeout_ms: 20_000,
            reasoning_timeout_ms: 60_000,
            max_retries: 1,
            retry_backoff_ms: 250,
            rate_limit_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSection {
    pub price_bucket: f64,
    /// Upper bound for one whole pipeline run (the cache producer).
    pub overall_timeout_secs: u64,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            price_bucket: 50.0,
            overall_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    pub workers: usize,
    pub retention_secs: u64,
    pub job_timeout_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            workers: 4,
            retention_secs: 3600,
            job_timeout_secs: 300,
            gc_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub workers: usize,
    pub tick_secs: u64,
    pub lease_ttl_secs: u64,
    pub failure_threshold: u32,
    pub alert_cooldown_secs: i64,
    pub min_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: 2,
            tick_secs: 5,
            lease_ttl_secs: 120,
            failure_threshold: 5,
            alert_cooldown_secs: 10_800,
            min_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySection {
    pub max_attempts: u8,
    pub base_backoff_ms: u64,
    pub send_timeout_secs: u64,
    pub push_endpoint: Option<String>,
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            send_timeout_secs: 10,
            push_endpoint: None,
        }
    }
}

fn default_smtp_port() -> u16 {
    465
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    pub from: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9898".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sources: SourcesSection,
    pub cache: CacheSection,
    pub aggregator: AggregatorSection,
    pub tasks: TasksSection,
    /// Overrides on top of the built-in table: `[quota.plus] search = 300`; `-1` = unlimited.
    pub quota: HashMap<String, HashMap<String, i64>>,
    pub scheduler: SchedulerSection,
    pub notify: NotifySection,
    pub smtp: Option<SmtpConfig>,
    pub ai: AiConfig,
    pub metrics_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: SourcesSection::default(),
            cache: CacheSection::default(),
            aggregator: AggregatorSection::default(),
            tasks: TasksSection::default(),
            quota: HashMap::new(),
            scheduler: SchedulerSection::default(),
            notify: NotifySection::default(),
            smtp: None,
            ai: AiConfig::default(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl AppConfig {
    /// $FARE_RADAR_CONFIG, then `config/fare_radar.toml`, then defaults.
    /// Env overrides and AI key resolution are applied in every case.
    pub fn load() -> Result<Self> {
        let mut cfg = if let Ok(p) = env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path {}", pb.display()));
            }
            Self::from_path(&pb)?
        } else {
            let pb = PathBuf::from(DEFAULT_PATH);
            if pb.exists() {
                Self::from_path(&pb)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env()?;
        cfg.validate().context("invalid timeout settings")?;
        Ok(cfg)
    }

    /// Parses one file without env overrides.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(s)?;
        // Fail on unknown tier/metric names early rather than at the first quota check.
        cfg.quota_limits()?;
        cfg.validate().context("invalid timeout settings")?;
        Ok(cfg)
    }

    /// Worst-case source time: every engine attempt timing out with backoff in
    /// between, then a full reasoning call. Must fit inside the overall timeout.
    pub fn worst_case_sources(&self) -> Duration {
        let s = &self.sources;
        let attempts = u64::from(s.max_retries) + 1;
        let backoff: u64 = (0..s.max_retries)
            .map(|i| s.retry_backoff_ms.saturating_mul(1 << i.min(6)))
            .fold(0, u64::saturating_add);
        Duration::from_millis(
            s.timeout_ms
                .saturating_mul(attempts)
                .saturating_add(backoff)
                .saturating_add(s.reasoning_timeout_ms),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.timeout_ms == 0 || self.sources.reasoning_timeout_ms == 0 {
            bail!("sources.timeout_ms and sources.reasoning_timeout_ms must be positive");
        }
        if self.aggregator.overall_timeout_secs == 0 {
            bail!("aggregator.overall_timeout_secs must be positive");
        }
        let worst = self.worst_case_sources();
        let overall = self.pipeline_timeout();
        if worst >= overall {
            bail!(
                "aggregator.overall_timeout_secs ({}s) must exceed the source budget of {}ms \
                 (timeout_ms x attempts + backoff + reasoning_timeout_ms)",
                overall.as_secs(),
                worst.as_millis()
            );
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("FARE_ENGINE_URL") {
            self.sources.fare_engine_url = Some(v);
        }
        if let Ok(v) = env::var("HIDDEN_ROUTE_URL") {
            self.sources.hidden_route_url = Some(v);
        }
        match self.sources.fare_engine_api_key.as_deref() {
            Some(k) if k.trim().eq_ignore_ascii_case("env") => {
                self.sources.fare_engine_api_key = Some(
                    env::var("FARE_ENGINE_API_KEY")
                        .map_err(|_| anyhow!("Missing FARE_ENGINE_API_KEY env var"))?,
                );
            }
            None => self.sources.fare_engine_api_key = env::var("FARE_ENGINE_API_KEY").ok(),
            Some(_) => {}
        }

        if let Ok(host) = env::var("SMTP_HOST") {
            let smtp = self.smtp.get_or_insert_with(|| SmtpConfig {
                host: String::new(),
                port: default_smtp_port(),
                user: String::new(),
                pass: String::new(),
                from: String::new(),
            });
            smtp.host = host;
        }
        if let Some(smtp) = self.smtp.as_mut() {
            if let Ok(v) = env::var("SMTP_USER") {
                smtp.user = v;
            }
            if let Ok(v) = env::var("SMTP_PASS") {
                smtp.pass = v;
            }
            if let Ok(v) = env::var("NOTIFY_EMAIL_FROM") {
                smtp.from = v;
            }
            if smtp.from.is_empty() {
                smtp.from = smtp.user.clone();
            }
        }

        if let Ok(v) = env::var("PUSH_ENDPOINT") {
            self.notify.push_endpoint = Some(v);
        }
        if let Ok(v) = env::var("METRICS_ADDR") {
            self.metrics_addr = v;
        }
        self.ai.resolve().context("resolving [ai] config")?;
        Ok(())
    }

    /// Built-in limits with the `[quota]` overrides applied.
    pub fn quota_limits(&self) -> Result<QuotaLimits> {
        let mut limits = QuotaLimits::default();
        for (tier, row) in &self.quota {
            let t: Tier = parse_name(tier).with_context(|| format!("unknown tier {tier:?}"))?;
            for (metric, &limit) in row {
                let m: Metric =
                    parse_name(metric).with_context(|| format!("unknown metric {metric:?}"))?;
                limits.set(t, m, limit);
            }
        }
        Ok(limits)
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            source_timeout: Duration::from_millis(self.sources.timeout_ms),
            reasoning_timeout: Duration::from_millis(self.sources.reasoning_timeout_ms),
            max_retries: self.sources.max_retries,
            retry_backoff: Duration::from_millis(self.sources.retry_backoff_ms),
            rate_limit_cooldown: Duration::from_secs(self.sources.rate_limit_cooldown_secs),
            price_bucket: self.aggregator.price_bucket,
            pipeline_budget: self.pipeline_timeout(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.aggregator.overall_timeout_secs)
    }

    pub fn task_config(&self) -> TaskManagerConfig {
        TaskManagerConfig {
            workers: self.tasks.workers,
            retention: Duration::from_secs(self.tasks.retention_secs),
            job_timeout: Duration::from_secs(self.tasks.job_timeout_secs),
            gc_interval: Duration::from_secs(self.tasks.gc_interval_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.scheduler.workers,
            tick: Duration::from_secs(self.scheduler.tick_secs),
            lease_ttl: Duration::from_secs(self.scheduler.lease_ttl_secs),
            failure_threshold: self.scheduler.failure_threshold,
            alert_cooldown_secs: self.scheduler.alert_cooldown_secs,
            price_bucket: self.aggregator.price_bucket,
            min_interval_secs: self.scheduler.min_interval_secs,
        }
    }

    pub fn notify_config(&self) -> NotifyConfig {
        NotifyConfig {
            max_attempts: self.notify.max_attempts,
            base_backoff: Duration::from_millis(self.notify.base_backoff_ms),
            send_timeout: Duration::from_secs(self.notify.send_timeout_secs),
        }
    }
}

/// Tier and metric names use their snake_case serde form.
fn parse_name<T: serde::de::DeserializeOwned>(name: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(
        name.trim().to_ascii_lowercase(),
    ))?)
}
