//! Core data shapes: queries, fingerprints, normalized flights and aggregated results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The three pipeline slots. Serialized under masked public labels so provider
/// identities never leak to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceId {
    /// Stage A: primary fare engine.
    #[serde(rename = "flight_engine_a")]
    Primary,
    /// Stage B: alternate engine with hidden-route scanning.
    #[serde(rename = "flight_engine_b")]
    Alternate,
    /// Stage C: AI reasoning synthesis.
    #[serde(rename = "ai_optimized")]
    Reasoning,
}

impl SourceId {
    pub fn label(self) -> &'static str {
        match self {
            SourceId::Primary => "flight_engine_a",
            SourceId::Alternate => "flight_engine_b",
            SourceId::Reasoning => "ai_optimized",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CabinClass {
    #[default]
    Economy,
    PremiumEconomy,
    Business,
    First,
}

impl CabinClass {
    pub fn as_str(self) -> &'static str {
        match self {
            CabinClass::Economy => "ECONOMY",
            CabinClass::PremiumEconomy => "PREMIUM_ECONOMY",
            CabinClass::Business => "BUSINESS",
            CabinClass::First => "FIRST",
        }
    }
}

/// An immutable flight search request. Construct with [`SearchQuery::one_way`] and the
/// `with_*` builders; codes and currency are upper-cased, locale lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    origin: String,
    destination: String,
    depart_date: NaiveDate,
    return_date: Option<NaiveDate>,
    passenger_count: u8,
    cabin_class: CabinClass,
    currency: String,
    locale: String,
}

impl SearchQuery {
    pub fn one_way(origin: &str, destination: &str, depart_date: NaiveDate) -> Self {
        Self {
            origin: origin.trim().to_ascii_uppercase(),
            destination: destination.trim().to_ascii_uppercase(),
            depart_date,
            return_date: None,
            passenger_count: 1,
            cabin_class: CabinClass::Economy,
            currency: "CNY".to_string(),
            locale: "zh".to_string(),
        }
    }

    pub fn with_return(mut self, date: NaiveDate) -> Self {
        self.return_date = Some(date);
        self
    }

    pub fn with_passengers(mut self, n: u8) -> Self {
        self.passenger_count = n;
        self
    }

    pub fn with_cabin(mut self, cabin: CabinClass) -> Self {
        self.cabin_class = cabin;
        self
    }

    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = currency.trim().to_ascii_uppercase();
        self
    }

    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = locale.trim().to_ascii_lowercase();
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
    pub fn destination(&self) -> &str {
        &self.destination
    }
    pub fn depart_date(&self) -> NaiveDate {
        self.depart_date
    }
    pub fn return_date(&self) -> Option<NaiveDate> {
        self.return_date
    }
    pub fn passenger_count(&self) -> u8 {
        self.passenger_count
    }
    pub fn cabin_class(&self) -> CabinClass {
        self.cabin_class
    }
    pub fn currency(&self) -> &str {
        &self.currency
    }
    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Structural checks an adapter would otherwise reject as `InvalidQuery`.
    pub fn validate(&self) -> Result<(), String> {
        let is_code = |s: &str| s.len() == 3 && s.chars().all(|c| c.is_ascii_alphabetic());
        if !is_code(&self.origin) {
            return Err(format!("origin `{}` is not an IATA code", self.origin));
        }
        if !is_code(&self.destination) {
            return Err(format!(
                "destination `{}` is not an IATA code",
                self.destination
            ));
        }
        if self.origin == self.destination {
            return Err("origin equals destination".into());
        }
        if let Some(r) = self.return_date {
            if r < self.depart_date {
                return Err("return date precedes departure".into());
            }
        }
        if !(1..=9).contains(&self.passenger_count) {
            return Err(format!("passenger count {} outside 1..=9", self.passenger_count));
        }
        Ok(())
    }

    /// Deterministic cache/dedup key over the normalized field set.
    pub fn fingerprint(&self) -> Fingerprint {
        let ret = self
            .return_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let canonical = format!(
            "v1|{}|{}|{}|{}|{}|{}|{}|{}",
            self.origin,
            self.destination,
            self.depart_date.format("%Y-%m-%d"),
            ret,
            self.passenger_count,
            self.cabin_class.as_str(),
            self.currency,
            self.locale
        );
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = String::with_capacity(32);
        for b in digest.iter().take(16) {
            use std::fmt::Write as _;
            let _ = write!(&mut hex, "{:02x}", b);
        }
        Fingerprint(hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub carrier: String,
    pub flight_number: String,
    pub from: String,
    pub to: String,
    pub departs_at: NaiveDateTime,
    pub arrives_at: NaiveDateTime,
}

/// Canonical flight shape every adapter payload is reduced to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFlight {
    pub source: SourceId,
    pub price: f64,
    pub currency: String,
    pub legs: Vec<Leg>,
    pub stops: u8,
    pub duration_minutes: u32,
    pub booking_token: String,
    /// Set when the ticket is booked beyond the traveller's real destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_destination: Option<String>,
}

impl NormalizedFlight {
    pub fn departs_at(&self) -> Option<NaiveDateTime> {
        self.legs.first().map(|l| l.departs_at)
    }

    /// `FROM-TO` over the first departure and last arrival airport.
    pub fn route(&self) -> String {
        match (self.legs.first(), self.legs.last()) {
            (Some(a), Some(b)) => format!("{}-{}", a.from, b.to),
            _ => String::new(),
        }
    }
}

/// Size accounting for one normalization pass. `reduction_ratio` is a percentage
/// rounded to one decimal.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CompressionStats {
    pub original_size: usize,
    pub cleaned_size: usize,
    pub reduction_ratio: f64,
}

impl CompressionStats {
    pub fn compute(original_size: usize, cleaned_size: usize) -> Self {
        let reduction_ratio = if original_size == 0 {
            0.0
        } else {
            let pct = (1.0 - cleaned_size as f64 / original_size as f64) * 100.0;
            (pct * 10.0).round() / 10.0
        };
        Self {
            original_size,
            cleaned_size,
            reduction_ratio,
        }
    }

    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a CompressionStats>) -> Self {
        let (o, c) = parts
            .into_iter()
            .fold((0usize, 0usize), |(o, c), s| (o + s.original_size, c + s.cleaned_size));
        Self::compute(o, c)
    }
}

/// Immutable snapshot produced by one aggregator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub query_fingerprint: Fingerprint,
    pub flights: Vec<NormalizedFlight>,
    pub sources_succeeded: BTreeSet<SourceId>,
    /// Failed source → short reason (`timeout`, `rate_limited`, ...).
    pub sources_failed: BTreeMap<SourceId, String>,
    pub compression_stats: CompressionStats,
    /// Markdown summary: the AI report when Stage C succeeded, otherwise a fallback.
    pub report: String,
    /// Booking tokens Stage C recommends, best first. Always a subset of `flights`;
    /// Stage C never adds flights of its own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommended: Vec<String>,
    pub produced_at: DateTime<Utc>,
}

impl AggregatedResult {
    pub fn cheapest(&self) -> Option<&NormalizedFlight> {
        self.flights
            .iter()
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    pub fn is_partial(&self) -> bool {
        !self.sources_failed.is_empty()
    }

    /// Flights behind `recommended`, in recommendation order.
    pub fn recommended_flights(&self) -> Vec<&NormalizedFlight> {
        self.recommended
            .iter()
            .filter_map(|t| self.flights.iter().find(|f| &f.booking_token == t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn fingerprint_ignores_case_and_whitespace() {
        let a = SearchQuery::one_way("sha", "nyc ", date("2025-09-15")).with_currency("cny");
        let b = SearchQuery::one_way("SHA", "NYC", date("2025-09-15")).with_currency("CNY");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 32);
    }

    #[test]
    fn fingerprint_changes_with_any_field() {
        let base = SearchQuery::one_way("SHA", "NYC", date("2025-09-15"));
        let other_day = SearchQuery::one_way("SHA", "NYC", date("2025-09-16"));
        let two_pax = base.clone().with_passengers(2);
        let business = base.clone().with_cabin(CabinClass::Business);
        assert_ne!(base.fingerprint(), other_day.fingerprint());
        assert_ne!(base.fingerprint(), two_pax.fingerprint());
        assert_ne!(base.fingerprint(), business.fingerprint());
    }

    #[test]
    fn validate_rejects_bad_codes_and_dates() {
        let ok = SearchQuery::one_way("SHA", "NYC", date("2025-09-15"));
        assert!(ok.validate().is_ok());
        assert!(SearchQuery::one_way("SH", "NYC", date("2025-09-15"))
            .validate()
            .is_err());
        assert!(ok.clone().with_return(date("2025-09-01")).validate().is_err());
        assert!(ok.with_passengers(0).validate().is_err());
    }

    #[test]
    fn compression_ratio_rounds_to_one_decimal() {
        let s = CompressionStats::compute(3000, 1000);
        assert_eq!(s.reduction_ratio, 66.7);
        assert_eq!(CompressionStats::compute(0, 0).reduction_ratio, 0.0);
        let c = CompressionStats::combine(&[
            CompressionStats::compute(100, 50),
            CompressionStats::compute(300, 50),
        ]);
        assert_eq!(c.original_size, 400);
        assert_eq!(c.reduction_ratio, 75.0);
    }
}
