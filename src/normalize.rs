//! Raw adapter payloads → canonical `NormalizedFlight`s plus size accounting.
//!
//! Everything here is pure: the same raw payload always produces the same flights and
//! the same `CompressionStats`.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;

use crate::model::{CompressionStats, Leg, NormalizedFlight, SourceId};
use crate::sources::RawSourceResult;

/// Output of one normalization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub source: SourceId,
    pub flights: Vec<NormalizedFlight>,
    /// Markdown analysis, only present for the reasoning stage.
    pub report: Option<String>,
    pub stats: CompressionStats,
    /// Entries dropped: missing/placeholder required fields or a repeated booking token.
    pub rejected: usize,
}

const PLACEHOLDERS: [&str; 4] = ["", "n/a", "null", "-"];
const PRICE_KEYS: [&str; 3] = ["price", "total_price", "cost"];
const TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
];

pub fn normalize(raw: &RawSourceResult, default_currency: &str) -> Normalized {
    let currency = top_level_currency(&raw.payload).unwrap_or_else(|| default_currency.to_string());

    let (candidates, report) = match raw.source {
        SourceId::Primary => (primary_entries(&raw.payload), None),
        SourceId::Alternate => (array(&raw.payload, "itineraries"), None),
        SourceId::Reasoning => (
            array(&raw.payload, "flights"),
            text(raw.payload.get("report")),
        ),
    };

    let total = candidates.len();
    let mut by_token: HashMap<String, usize> = HashMap::new();
    let mut flights: Vec<NormalizedFlight> = Vec::with_capacity(total);
    for entry in candidates {
        let parsed = match raw.source {
            SourceId::Primary => primary_flight(entry, &currency),
            SourceId::Alternate => alternate_flight(entry, &currency),
            SourceId::Reasoning => generic_flight(entry, &currency),
        };
        let Some(mut f) = parsed else { continue };
        f.source = raw.source;
        // Same booking token twice in one payload: keep the cheaper copy.
        match by_token.get(&f.booking_token) {
            Some(&i) if flights[i].price <= f.price => {}
            Some(&i) => flights[i] = f,
            None => {
                by_token.insert(f.booking_token.clone(), flights.len());
                flights.push(f);
            }
        }
    }
    let kept = flights.len();

    let original_size = serde_json::to_string(&raw.payload).map_or(0, |s| s.len());
    let cleaned_size = serde_json::to_string(&flights).map_or(0, |s| s.len())
        + report.as_ref().map_or(0, |r| r.len());

    Normalized {
        source: raw.source,
        flights,
        report,
        stats: CompressionStats::compute(original_size, cleaned_size),
        rejected: total.saturating_sub(kept),
    }
}

/// Decode entities, strip tags and collapse whitespace in provider text.
pub fn normalize_text(s: &str) -> String {
    let out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    let out = re_tags.replace_all(&out, "");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// First positive price among the known price fields. Strings lose symbols and
/// thousands separators; `{ "amount": .. }` objects are unwrapped.
pub fn extract_price(obj: &Value) -> Option<f64> {
    PRICE_KEYS
        .iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(price_value)
        .find(|p| *p > 0.0)
}

fn price_value(v: &Value) -> Option<f64> {
    let p = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            cleaned.parse().ok()
        }
        Value::Object(_) => v.get("amount").and_then(price_value),
        _ => None,
    };
    p.filter(|p| p.is_finite())
}

fn text(v: Option<&Value>) -> Option<String> {
    let s = match v? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if PLACEHOLDERS.contains(&s.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(s)
    }
}

fn time(v: Option<&Value>) -> Option<NaiveDateTime> {
    let s = text(v)?;
    TIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&s, f).ok())
}

fn array<'a>(v: &'a Value, key: &str) -> Vec<&'a Value> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

fn top_level_currency(payload: &Value) -> Option<String> {
    text(payload.get("currency"))
        .or_else(|| text(payload.pointer("/search_parameters/currency")))
        .map(|c| c.to_ascii_uppercase())
}

fn primary_entries(payload: &Value) -> Vec<&Value> {
    let mut out = array(payload, "best_flights");
    out.extend(array(payload, "other_flights"));
    out
}

/// `"MU 587"` → `("MU", "587")`; falls back to the airline name as carrier.
fn split_flight_number(raw: &str, airline: Option<&str>) -> (String, String) {
    let compact: String = raw.split_whitespace().collect();
    let code_len = compact
        .char_indices()
        .take_while(|(i, c)| *i < 2 || c.is_ascii_alphabetic())
        .take(3)
        .count();
    let (code, num) = compact.split_at(code_len.min(compact.len()));
    if code.len() >= 2 && !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()) {
        (code.to_ascii_uppercase(), num.to_string())
    } else {
        (
            airline.map(normalize_text).unwrap_or_default(),
            compact,
        )
    }
}

fn finish(
    legs: Vec<Leg>,
    price: f64,
    currency: &str,
    duration: Option<u32>,
    booking_token: String,
    hidden_destination: Option<String>,
) -> Option<NormalizedFlight> {
    let first = legs.first()?;
    let last = legs.last()?;
    let derived = (last.arrives_at - first.departs_at).num_minutes();
    let duration_minutes = duration
        .filter(|d| *d > 0)
        .unwrap_or_else(|| u32::try_from(derived).unwrap_or(0));
    Some(NormalizedFlight {
        source: SourceId::Primary,
        price,
        currency: currency.to_string(),
        stops: u8::try_from(legs.len() - 1).unwrap_or(u8::MAX),
        legs,
        duration_minutes,
        booking_token,
        hidden_destination: hidden_destination.map(|h| h.to_ascii_uppercase()),
    })
}

fn primary_flight(group: &Value, currency: &str) -> Option<NormalizedFlight> {
    let price = extract_price(group)?;
    let token = text(group.get("booking_token"))?;
    let mut legs = Vec::new();
    for seg in group.get("flights")?.as_array()? {
        let airline = text(seg.get("airline"));
        let (carrier, flight_number) =
            split_flight_number(&text(seg.get("flight_number"))?, airline.as_deref());
        legs.push(Leg {
            carrier,
            flight_number,
            from: text(seg.pointer("/departure_airport/id"))?,
            to: text(seg.pointer("/arrival_airport/id"))?,
            departs_at: time(seg.pointer("/departure_airport/time"))?,
            arrives_at: time(seg.pointer("/arrival_airport/time"))?,
        });
    }
    let duration = group
        .get("total_duration")
        .and_then(Value::as_u64)
        .and_then(|d| u32::try_from(d).ok());
    let currency = text(group.get("currency")).unwrap_or_else(|| currency.to_string());
    finish(legs, price, &currency, duration, token, None)
}

fn alternate_flight(it: &Value, currency: &str) -> Option<NormalizedFlight> {
    let price = extract_price(it)?;
    let token = text(it.get("booking_token")).or_else(|| text(it.get("id")))?;
    let mut legs = Vec::new();
    for seg in it.get("segments")?.as_array()? {
        let name = text(seg.get("carrier_name"));
        let carrier = text(seg.get("carrier"))
            .map(|c| c.to_ascii_uppercase())
            .or_else(|| name.as_deref().map(normalize_text))?;
        legs.push(Leg {
            carrier,
            flight_number: text(seg.get("flight_no"))?,
            from: text(seg.get("from"))?,
            to: text(seg.get("to"))?,
            departs_at: time(seg.get("departure"))?,
            arrives_at: time(seg.get("arrival"))?,
        });
    }
    let duration = it
        .get("duration")
        .and_then(Value::as_u64)
        .and_then(|secs| u32::try_from(secs / 60).ok());
    let hidden = text(it.pointer("/hidden_city/code"))
        .or_else(|| text(it.get("hidden_city")))
        .or_else(|| text(it.get("hidden_destination")));
    let currency = text(it.pointer("/price/currency"))
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or_else(|| currency.to_string());
    finish(legs, price, &currency, duration, token, hidden)
}

fn generic_flight(f: &Value, currency: &str) -> Option<NormalizedFlight> {
    let price = extract_price(f)?;
    let token = text(f.get("booking_token"))?;
    let mut legs = Vec::new();
    for leg in f.get("legs")?.as_array()? {
        legs.push(Leg {
            carrier: text(leg.get("carrier"))?,
            flight_number: text(leg.get("flight_number"))?,
            from: text(leg.get("from"))?,
            to: text(leg.get("to"))?,
            departs_at: time(leg.get("departs_at"))?,
            arrives_at: time(leg.get("arrives_at"))?,
        });
    }
    let duration = f
        .get("duration_minutes")
        .and_then(Value::as_u64)
        .and_then(|d| u32::try_from(d).ok());
    let currency = text(f.get("currency")).unwrap_or_else(|| currency.to_string());
    finish(
        legs,
        price,
        &currency,
        duration,
        token,
        text(f.get("hidden_destination")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SearchQuery;
    use chrono::NaiveDate;
    use serde_json::json;

    fn raw(source: SourceId, payload: Value) -> RawSourceResult {
        let q = SearchQuery::one_way("SHA", "NYC", NaiveDate::from_ymd_opt(2025, 9, 15).unwrap());
        RawSourceResult::new(source, &q, payload)
    }

    #[test]
    fn price_fields_collapse() {
        assert_eq!(extract_price(&json!({"price": 4200})), Some(4200.0));
        assert_eq!(extract_price(&json!({"price": {"amount": "3,900"}})), Some(3900.0));
        assert_eq!(extract_price(&json!({"total_price": "¥1,234.5"})), Some(1234.5));
        assert_eq!(extract_price(&json!({"price": 0, "cost": 99})), Some(99.0));
        assert_eq!(extract_price(&json!({"price": "N/A"})), None);
    }

    #[test]
    fn flight_numbers_split_into_carrier_code() {
        assert_eq!(split_flight_number("MU 587", None), ("MU".into(), "587".into()));
        assert_eq!(split_flight_number("3U8899", None), ("3U".into(), "8899".into()));
        assert_eq!(
            split_flight_number("Charter", Some("Sky &amp; Sea")),
            ("Sky & Sea".into(), "Charter".into())
        );
    }

    #[test]
    fn primary_group_becomes_one_flight_with_stops() {
        let payload = json!({
            "search_metadata": {"id": "abc", "status": "Success"},
            "best_flights": [{
                "flights": [
                    {"departure_airport": {"id": "PVG", "time": "2025-09-15 10:00"},
                     "arrival_airport": {"id": "ICN", "time": "2025-09-15 13:00"},
                     "airline": "Korean Air", "flight_number": "KE 894", "legroom": "31 in"},
                    {"departure_airport": {"id": "ICN", "time": "2025-09-15 15:00"},
                     "arrival_airport": {"id": "JFK", "time": "2025-09-15 16:30"},
                     "airline": "Korean Air", "flight_number": "KE 81"}
                ],
                "total_duration": 1110,
                "price": 4200,
                "booking_token": "tok-a",
                "carbon_emissions": {"this_flight": 1000}
            }]
        });
        let n = normalize(&raw(SourceId::Primary, payload), "CNY");
        assert_eq!(n.flights.len(), 1);
        let f = &n.flights[0];
        assert_eq!(f.stops, 1);
        assert_eq!(f.route(), "PVG-JFK");
        assert_eq!(f.currency, "CNY");
        assert_eq!(f.duration_minutes, 1110);
        assert!(n.stats.reduction_ratio > 0.0);
    }

    #[test]
    fn placeholder_fields_reject_the_entry() {
        let payload = json!({"itineraries": [
            {"id": "x1", "price": {"amount": "3900"}, "segments": [
                {"from": "PVG", "to": "JFK", "carrier": "MU", "flight_no": "587",
                 "departure": "N/A", "arrival": "2025-09-15T23:00:00"}]},
            {"id": "x2", "price": 0, "segments": []}
        ]});
        let n = normalize(&raw(SourceId::Alternate, payload), "CNY");
        assert!(n.flights.is_empty());
        assert_eq!(n.rejected, 2);
    }

    #[test]
    fn hidden_city_annotation_survives() {
        let payload = json!({"currency": "cny", "itineraries": [{
            "id": "h1", "price": {"amount": "3900"}, "duration": 46800,
            "hidden_city": {"code": "bos"},
            "segments": [{"from": "PVG", "to": "JFK", "carrier": "mu", "flight_no": "587",
                          "departure": "2025-09-15T10:00:00", "arrival": "2025-09-15T23:00:00"}]
        }]});
        let n = normalize(&raw(SourceId::Alternate, payload), "USD");
        let f = &n.flights[0];
        assert_eq!(f.hidden_destination.as_deref(), Some("BOS"));
        assert_eq!(f.legs[0].carrier, "MU");
        assert_eq!(f.currency, "CNY");
        assert_eq!(f.duration_minutes, 780);
        assert_eq!(f.source, SourceId::Alternate);
    }

    #[test]
    fn duplicate_tokens_keep_cheaper_copy() {
        let seg = json!([{"from": "PVG", "to": "JFK", "carrier": "MU", "flight_no": "587",
                          "departure": "2025-09-15T10:00:00", "arrival": "2025-09-15T23:00:00"}]);
        let payload = json!({"itineraries": [
            {"id": "same", "price": 4000, "segments": seg},
            {"id": "same", "price": 3800, "segments": seg}
        ]});
        let n = normalize(&raw(SourceId::Alternate, payload), "CNY");
        assert_eq!(n.flights.len(), 1);
        assert_eq!(n.flights[0].price, 3800.0);
        assert_eq!(n.rejected, 1);
    }

    #[test]
    fn normalization_is_deterministic() {
        let payload = json!({"report": "## ok", "flights": []});
        let a = normalize(&raw(SourceId::Reasoning, payload.clone()), "CNY");
        let b = normalize(&raw(SourceId::Reasoning, payload), "CNY");
        assert_eq!(a, b);
        assert_eq!(a.report.as_deref(), Some("## ok"));
    }
}
