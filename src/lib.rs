// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod quota;
pub mod sources;
pub mod store;
pub mod tasks;

// Recurring price watches and their notifications
pub mod monitor;
pub mod notify;

pub mod service;

// ---- Re-exports for stable public API ----
pub use crate::aggregator::{Aggregator, AggregatorConfig, CancelToken};
pub use crate::config::AppConfig;
pub use crate::error::{
    MonitorError, NotifyError, QuotaError, SearchError, SourceError, StoreError, TaskError,
};
pub use crate::model::{AggregatedResult, NormalizedFlight, SearchQuery, SourceId};
pub use crate::quota::{Metric, Principal, Tier, Window};
pub use crate::service::{FareRadar, Stores};
