//! Stage B: alternate engine that also scans hidden-city ("skiplagged") itineraries.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{get_json, parse_fixture, Mode, RawSourceResult, SourceAdapter};
use crate::error::SourceError;
use crate::model::{NormalizedFlight, SearchQuery, SourceId};

pub struct HiddenRouteAdapter {
    mode: Mode,
    include_hidden: bool,
}

impl HiddenRouteAdapter {
    pub fn from_fixture(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
            include_hidden: true,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let mode = Mode::http(url).context("building hidden-route http client")?;
        Ok(Self {
            mode,
            include_hidden: true,
        })
    }

    /// Disable throwaway-ticket scanning; only regular itineraries are requested.
    pub fn without_hidden_city(mut self) -> Self {
        self.include_hidden = false;
        self
    }

    fn params(&self, q: &SearchQuery) -> Vec<(&'static str, String)> {
        let mut p = vec![
            ("source", q.origin().to_string()),
            ("destination", q.destination().to_string()),
            ("outboundDate", q.depart_date().format("%Y-%m-%d").to_string()),
            ("adults", q.passenger_count().to_string()),
            ("cabinClass", q.cabin_class().as_str().to_string()),
            ("currency", q.currency().to_lowercase()),
            ("locale", q.locale().to_string()),
            ("enableThrowAwayTicketing", self.include_hidden.to_string()),
        ];
        if let Some(r) = q.return_date() {
            p.push(("inboundDate", r.format("%Y-%m-%d").to_string()));
        }
        p
    }
}

#[async_trait]
impl SourceAdapter for HiddenRouteAdapter {
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
                let kind = if query.return_date().is_some() {
                    "round-trip"
                } else {
                    "one-way"
                };
                get_json(client, &format!("{url}/{kind}"), &self.params(query), timeout).await?
            }
        };
        Ok(RawSourceResult::new(self.id(), query, payload))
    }

    fn id(&self) -> SourceId {
        SourceId::Alternate
    }

    fn name(&self) -> &'static str {
        "hidden_route"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn hidden_scan_flag_is_forwarded() {
        let q = SearchQuery::one_way("SHA", "NYC", NaiveDate::from_ymd_opt(2025, 9, 15).unwrap());
        let on = HiddenRouteAdapter::from_fixture("{}");
        let off = HiddenRouteAdapter::from_fixture("{}").without_hidden_city();
        assert!(on
            .params(&q)
            .contains(&("enableThrowAwayTicketing", "true".to_string())));
        assert!(off
            .params(&q)
            .contains(&("enableThrowAwayTicketing", "false".to_string())));
    }
}
