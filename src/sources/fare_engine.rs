//! Stage A: primary fare engine (grouped `best_flights` / `other_flights` payloads).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{get_json, parse_fixture, Mode, RawSourceResult, SourceAdapter};
use crate::error::SourceError;
use crate::model::{NormalizedFlight, SearchQuery, SourceId};

pub struct FareEngineAdapter {
    mode: Mode,
    api_key: Option<String>,
}

impl FareEngineAdapter {
    pub fn from_fixture(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
            api_key: None,
        }
    }

    pub fn from_url(url: &str, api_key: Option<String>) -> Result<Self> {
        let mode = Mode::http(url).context("building fare engine http client")?;
        Ok(Self { mode, api_key })
    }

    fn params(&self, q: &SearchQuery) -> Vec<(&'static str, String)> {
        let mut p = vec![
            ("departure_id", q.origin().to_string()),
            ("arrival_id", q.destination().to_string()),
            ("outbound_date", q.depart_date().format("%Y-%m-%d").to_string()),
            ("adults", q.passenger_count().to_string()),
            ("travel_class", q.cabin_class().as_str().to_ascii_lowercase()),
            ("currency", q.currency().to_string()),
            ("hl", q.locale().to_string()),
            (
                "type",
                if q.return_date().is_some() { "1" } else { "2" }.to_string(),
            ),
        ];
        if let Some(r) = q.return_date() {
            p.push(("return_date", r.format("%Y-%m-%d").to_string()));
        }
        if let Some(k) = &self.api_key {
            p.push(("api_key", k.clone()));
        }
        p
    }
}

#[async_trait]
impl SourceAdapter for FareEngineAdapter {
    async fn fetch(
        &self,
        query: &SearchQuery,
        _context: &[NormalizedFlight],
        timeout: Duration,
    ) -> Result<RawSourceResult, SourceError> {
        query.validate().map_err(SourceError::InvalidQuery)?;
        let payload = match &self.mode {
            Mode::Fixture(s) => parse_fixture(s)?,
            Mode::Http { url, client } => {
                get_json(client, &format!("{url}/search"), &self.params(query), timeout).await?
            }
        };
        tracing::trace!(target: "sources", source = self.name(), "payload received");
        Ok(RawSourceResult::new(self.id(), query, payload))
    }

    fn id(&self) -> SourceId {
        SourceId::Primary
    }

    fn name(&self) -> &'static str {
        "fare_engine"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn query() -> SearchQuery {
        SearchQuery::one_way("SHA", "NYC", NaiveDate::from_ymd_opt(2025, 9, 15).unwrap())
    }

    #[tokio::test]
    async fn fixture_mode_tags_payload() {
        let a = FareEngineAdapter::from_fixture(r#"{"best_flights":[]}"#);
        let raw = a.fetch(&query(), &[], Duration::from_secs(1)).await.unwrap();
        assert_eq!(raw.source, SourceId::Primary);
        assert_eq!(raw.query_fingerprint, query().fingerprint());
        assert!(raw.payload.get("best_flights").is_some());
    }

    #[tokio::test]
    async fn malformed_query_is_rejected_before_any_call() {
        let a = FareEngineAdapter::from_fixture("{}");
        let bad = SearchQuery::one_way("SHA", "SHA", NaiveDate::from_ymd_opt(2025, 9, 15).unwrap());
        let err = a.fetch(&bad, &[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidQuery(_)));
    }

    #[test]
    fn round_trip_query_sets_return_date_param() {
        let a = FareEngineAdapter::from_fixture("{}");
        let q = query().with_return(NaiveDate::from_ymd_opt(2025, 9, 25).unwrap());
        let p = a.params(&q);
        assert!(p.contains(&("return_date", "2025-09-25".to_string())));
        assert!(p.contains(&("type", "1".to_string())));
    }
}
