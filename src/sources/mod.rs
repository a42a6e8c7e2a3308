//! Upstream flight-data providers behind a single `fetch` capability.

pub mod ai_reasoning;
pub mod fare_engine;
pub mod hidden_route;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::model::{Fingerprint, NormalizedFlight, SearchQuery, SourceId};

pub use ai_reasoning::AiReasoningAdapter;
pub use fare_engine::FareEngineAdapter;
pub use hidden_route::HiddenRouteAdapter;

/// Adapter payload before normalization. Only the normalizer looks inside `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceResult {
    pub source: SourceId,
    pub fetched_at: DateTime<Utc>,
    pub query_fingerprint: Fingerprint,
    pub payload: serde_json::Value,
}

impl RawSourceResult {
    pub fn new(source: SourceId, query: &SearchQuery, payload: serde_json::Value) -> Self {
        Self {
            source,
            fetched_at: Utc::now(),
            query_fingerprint: query.fingerprint(),
            payload,
        }
    }
}

/// One upstream provider. Implementations do not retry; the aggregator owns that.
///
/// `context` carries the merged Stage A/B flights and is empty for the fare engines.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch(
        &self,
        query: &SearchQuery,
        context: &[NormalizedFlight],
        timeout: Duration,
    ) -> Result<RawSourceResult, SourceError>;

    fn id(&self) -> SourceId;

    fn name(&self) -> &'static str;
}

pub type DynAdapter = Arc<dyn SourceAdapter>;

/// Statically known adapter slots. Any slot may be left empty.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    pub primary: Option<DynAdapter>,
    pub alternate: Option<DynAdapter>,
    pub reasoning: Option<DynAdapter>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_primary(mut self, a: DynAdapter) -> Self {
        self.primary = Some(a);
        self
    }

    pub fn with_alternate(mut self, a: DynAdapter) -> Self {
        self.alternate = Some(a);
        self
    }

    pub fn with_reasoning(mut self, a: DynAdapter) -> Self {
        self.reasoning = Some(a);
        self
    }

    pub fn configured(&self) -> Vec<SourceId> {
        [&self.primary, &self.alternate, &self.reasoning]
            .into_iter()
            .flatten()
            .map(|a| a.id())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.alternate.is_none() && self.reasoning.is_none()
    }
}

/// Where an HTTP-backed adapter gets its payload.
pub(crate) enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

impl Mode {
    pub(crate) fn http(url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fare-radar/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .build()?;
        Ok(Mode::Http {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

/// Shared GET-JSON call for the fare engines, with status classification.
pub(crate) async fn get_json(
    client: &reqwest::Client,
    url: &str,
    params: &[(&str, String)],
    timeout: Duration,
) -> Result<serde_json::Value, SourceError> {
    let rsp = client
        .get(url)
        .query(params)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_transport(e, timeout))?;
    read_json(rsp, timeout).await
}

pub(crate) async fn read_json(
    rsp: reqwest::Response,
    timeout: Duration,
) -> Result<serde_json::Value, SourceError> {
    let status = rsp.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(SourceError::RateLimited);
    }
    if status == reqwest::StatusCode::BAD_REQUEST
        || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
    {
        let body = rsp.text().await.unwrap_or_default();
        return Err(SourceError::InvalidQuery(truncate(&body, 200)));
    }
    if !status.is_success() {
        return Err(SourceError::Upstream(format!("http {}", status.as_u16())));
    }
    rsp.json::<serde_json::Value>()
        .await
        .map_err(|e| classify_transport(e, timeout))
}

pub(crate) fn classify_transport(e: reqwest::Error, timeout: Duration) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout(timeout.as_millis() as u64)
    } else if e.is_decode() {
        SourceError::Upstream(format!("decode: {e}"))
    } else {
        SourceError::Upstream(e.to_string())
    }
}

pub(crate) fn parse_fixture(s: &str) -> Result<serde_json::Value, SourceError> {
    serde_json::from_str(s).map_err(|e| SourceError::Upstream(format!("fixture: {e}")))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(SourceId);

    #[async_trait]
    impl SourceAdapter for Dummy {
        async fn fetch(
            &self,
            q: &SearchQuery,
            _context: &[NormalizedFlight],
            _timeout: Duration,
        ) -> Result<RawSourceResult, SourceError> {
            Ok(RawSourceResult::new(self.0, q, serde_json::json!({})))
        }
        fn id(&self) -> SourceId {
            self.0
        }
        fn name(&self) -> &'static str {
            "dummy"
        }
    }

    #[test]
    fn registry_lists_filled_slots_in_stage_order() {
        let reg = SourceRegistry::new()
            .with_reasoning(Arc::new(Dummy(SourceId::Reasoning)))
            .with_primary(Arc::new(Dummy(SourceId::Primary)));
        assert_eq!(
            reg.configured(),
            vec![SourceId::Primary, SourceId::Reasoning]
        );
        assert!(!reg.is_empty());
        assert!(SourceRegistry::new().is_empty());
    }

    #[test]
    fn broken_fixture_is_upstream_failure() {
        let err = parse_fixture("{not json").unwrap_err();
        assert_eq!(err.reason(), "upstream");
    }
}
