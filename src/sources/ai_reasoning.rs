//! Stage C: AI reasoning over the merged Stage A/B flights.
//! OpenAI-compatible chat completions; the model answers with a markdown report plus
//! the booking tokens it recommends. A per-day call budget guards the provider bill.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{classify_transport, read_json, RawSourceResult, SourceAdapter};
use crate::config::ai::AiConfig;
use crate::error::SourceError;
use crate::model::{NormalizedFlight, SearchQuery, SourceId};

const REPORT_MAX_CHARS: usize = 8_000;

enum AiMode {
    /// Canned model answer (the assistant message content).
    Fixture(String),
    Http {
        client: reqwest::Client,
        base_url: String,
        api_key: String,
        model: String,
        temperature: f32,
    },
}

pub struct AiReasoningAdapter {
    mode: AiMode,
    max_context: usize,
    daily_limit: u32,
    counter: Mutex<DailyCounter>,
}

#[derive(Debug, Clone)]
struct DailyCounter {
    date: NaiveDate,
    count: u32,
}

impl DailyCounter {
    fn today() -> Self {
        Self {
            date: Utc::now().date_naive(),
            count: 0,
        }
    }
}

/// What we ask the model to return.
#[derive(Debug, Deserialize)]
struct ModelAnswer {
    report: String,
    #[serde(default)]
    picks: Vec<String>,
}

impl AiReasoningAdapter {
    pub fn from_config(cfg: &AiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fare-radar/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .build()
            .context("building ai http client")?;
        Ok(Self {
            mode: AiMode::Http {
                client,
                base_url: cfg.base_url.clone(),
                api_key: cfg.api_key.clone(),
                model: cfg.model.clone(),
                temperature: cfg.temperature,
            },
            max_context: cfg.max_context_flights,
            daily_limit: cfg.daily_limit,
            counter: Mutex::new(DailyCounter::today()),
        })
    }

    pub fn from_fixture(answer: &str) -> Self {
        Self {
            mode: AiMode::Fixture(answer.to_string()),
            max_context: 20,
            daily_limit: u32::MAX,
            counter: Mutex::new(DailyCounter::today()),
        }
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = limit;
        self
    }

    /// Takes one call from today's budget; check and increment share one lock.
    /// Every model call counts, answered or not.
    fn try_reserve_call(&self) -> bool {
        let mut g = self.counter.lock();
        let today = Utc::now().date_naive();
        if g.date != today {
            *g = DailyCounter {
                date: today,
                count: 0,
            };
        }
        if g.count >= self.daily_limit {
            return false;
        }
        g.count += 1;
        true
    }

    async fn ask(&self, prompt: &str, timeout: Duration) -> Result<String, SourceError> {
        match &self.mode {
            AiMode::Fixture(s) => Ok(s.clone()),
            AiMode::Http {
                client,
                base_url,
                api_key,
                model,
                temperature,
            } => {
                #[derive(Serialize)]
                struct Msg<'a> {
                    role: &'a str,
                    content: &'a str,
                }
                #[derive(Serialize)]
                struct Req<'a> {
                    model: &'a str,
                    messages: Vec<Msg<'a>>,
                    temperature: f32,
                    response_format: serde_json::Value,
                }
                #[derive(Deserialize)]
                struct Resp {
                    choices: Vec<Choice>,
                }
                #[derive(Deserialize)]
                struct Choice {
                    message: ChoiceMsg,
                }
                #[derive(Deserialize)]
                struct ChoiceMsg {
                    content: Option<String>,
                }

                let req = Req {
                    model,
                    messages: vec![
                        Msg {
                            role: "system",
                            content: SYSTEM_PROMPT,
                        },
                        Msg {
                            role: "user",
                            content: prompt,
                        },
                    ],
                    temperature: *temperature,
                    response_format: json!({"type": "json_object"}),
                };

                let rsp = client
                    .post(format!("{base_url}/chat/completions"))
                    .bearer_auth(api_key)
                    .timeout(timeout)
                    .json(&req)
                    .send()
                    .await
                    .map_err(|e| classify_transport(e, timeout))?;
                let body = read_json(rsp, timeout).await?;
                let body: Resp = serde_json::from_value(body)
                    .map_err(|e| SourceError::Upstream(format!("ai response shape: {e}")))?;
                Ok(body
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default())
            }
        }
    }
}

const SYSTEM_PROMPT: &str = "You are a flight deal analyst. You receive a list of candidate flights. \
Reply with a JSON object {\"report\": string, \"picks\": [string]}. `report` is a concise markdown \
analysis (cheapest option, best value, hidden-city risks). `picks` holds up to 10 booking tokens \
copied verbatim from the list, best first. Never invent tokens.";

/// Compact one-line-per-flight summary handed to the model.
pub fn build_prompt(query: &SearchQuery, context: &[NormalizedFlight], max: usize) -> String {
    let mut out = format!(
        "Route {}→{} on {}{} for {} passenger(s), cabin {}, currency {}.\nCandidates:\n",
        query.origin(),
        query.destination(),
        query.depart_date(),
        query
            .return_date()
            .map(|r| format!(" returning {r}"))
            .unwrap_or_default(),
        query.passenger_count(),
        query.cabin_class().as_str(),
        query.currency()
    );
    let mut sorted: Vec<&NormalizedFlight> = context.iter().collect();
    sorted.sort_by(|a, b| a.price.total_cmp(&b.price));
    for (i, f) in sorted.into_iter().take(max).enumerate() {
        let carriers: Vec<String> = f
            .legs
            .iter()
            .map(|l| format!("{}{}", l.carrier, l.flight_number))
            .collect();
        let departs = f
            .departs_at()
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        out.push_str(&format!(
            "{}. {} {} dep {} | {} stop(s) | {}min | {:.0} {} | token={}{}\n",
            i + 1,
            f.route(),
            carriers.join("/"),
            departs,
            f.stops,
            f.duration_minutes,
            f.price,
            f.currency,
            f.booking_token,
            f.hidden_destination
                .as_deref()
                .map(|h| format!(" | hidden-city via {h}"))
                .unwrap_or_default()
        ));
    }
    out
}

/// Strips code fences around a JSON answer.
fn unfence(s: &str) -> &str {
    let t = s.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

/// Drops control characters except newlines and caps the length.
pub fn sanitize_report(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(REPORT_MAX_CHARS));
    for (n, ch) in input.chars().enumerate() {
        if n >= REPORT_MAX_CHARS {
            break;
        }
        match ch {
            '\r' => {}
            '\n' | '\t' => out.push(ch),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

#[async_trait]
impl SourceAdapter for AiReasoningAdapter {
    async fn fetch(
        &self,
        query: &SearchQuery,
        context: &[NormalizedFlight],
        timeout: Duration,
    ) -> Result<RawSourceResult, SourceError> {
        if context.is_empty() {
            return Err(SourceError::Upstream("no candidate flights to analyse".into()));
        }
        if !self.try_reserve_call() {
            return Err(SourceError::RateLimited);
        }

        let prompt = build_prompt(query, context, self.max_context);
        let content = self.ask(&prompt, timeout).await?;
        let answer: ModelAnswer = serde_json::from_str(unfence(&content))
            .map_err(|e| SourceError::Upstream(format!("unparsable ai answer: {e}")))?;
        let report = sanitize_report(&answer.report);
        if report.is_empty() {
            return Err(SourceError::Upstream("empty ai report".into()));
        }

        let picked: Vec<serde_json::Value> = answer
            .picks
            .iter()
            .filter_map(|tok| context.iter().find(|f| &f.booking_token == tok))
            .filter_map(|f| serde_json::to_value(f).ok())
            .collect();

        tracing::debug!(
            target: "sources",
            source = self.name(),
            picks = picked.len(),
            "ai analysis received"
        );
        Ok(RawSourceResult::new(
            self.id(),
            query,
            json!({ "report": report, "flights": picked }),
        ))
    }

    fn id(&self) -> SourceId {
        SourceId::Reasoning
    }

    fn name(&self) -> &'static str {
        "ai_reasoning"
    }
}
