// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_daily_limit() -> u32 {
    200
}
fn default_max_context() -> usize {
    20
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OpenAI-compatible endpoint root (`.../v1`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// "ENV" means: read from AI_API_KEY
    #[serde(default)]
    pub api_key: String,
    /// Real provider calls per UTC day; exhausted budget reports `RateLimited`.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Cheapest N merged flights handed to the model as context.
    #[serde(default = "default_max_context")]
    pub max_context_flights: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_base_url(),
            model: default_model(),
            api_key: String::new(),
            daily_limit: default_daily_limit(),
            max_context_flights: default_max_context(),
            temperature: default_temperature(),
        }
    }
}

impl AiConfig {
    /// Resolves `api_key = "ENV"`, applies env overrides and clamps numeric knobs.
    pub fn resolve(&mut self) -> anyhow::Result<()> {
        if let Ok(url) = env::var("AI_API_URL") {
            self.base_url = url;
        }
        if let Ok(model) = env::var("AI_MODEL") {
            self.model = model;
        }

        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = env::var("AI_API_KEY")
                .map_err(|_| anyhow::anyhow!("Missing AI_API_KEY env var"))?;
        } else if self.api_key.is_empty() {
            if let Ok(k) = env::var("AI_API_KEY") {
                self.api_key = k;
            }
        }

        if self.enabled && self.api_key.trim().is_empty() {
            anyhow::bail!("AI stage enabled but no api key configured");
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            self.temperature = default_temperature();
        }
        self.max_context_flights = self.max_context_flights.clamp(1, 50);
        self.base_url = self.base_url.trim_end_matches('/').to_string();
        Ok(())
    }
}
