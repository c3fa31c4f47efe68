use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::read_f64;

/// One unit of the client-facing stream protocol.
///
/// Frames are internally tagged, so the terminal `done` frame is
/// `{"type":"done"}` and can never be confused with generated text that
/// happens to read `[DONE]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    TextDelta {
        text: String,
    },
    Progress {
        percent: f64,
        #[serde(default)]
        stage: String,
    },
    Usage(Usage),
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Document {
        payload: Value,
    },
    Error {
        message: String,
    },
    Done,
}

impl RelayFrame {
    pub fn text(text: impl Into<String>) -> Self {
        RelayFrame::TextDelta { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RelayFrame::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayFrame::Error { .. } | RelayFrame::Done)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayFrame::TextDelta { .. } => "text_delta",
            RelayFrame::Progress { .. } => "progress",
            RelayFrame::Usage(_) => "usage",
            RelayFrame::Session { .. } => "session",
            RelayFrame::Document { .. } => "document",
            RelayFrame::Error { .. } => "error",
            RelayFrame::Done => "done",
        }
    }

    pub fn to_event(&self) -> Event {
        match serde_json::to_string(self) {
            Ok(serialized) => Event::default().data(serialized),
            Err(error) => {
                let fallback = serde_json::json!({
                    "type": "error",
                    "message": format!("serialization error: {error}"),
                });
                Event::default().data(fallback.to_string())
            }
        }
    }
}

/// Cumulative token accounting snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, alias = "input_tokens", alias = "prompt_tokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "output_tokens", alias = "completion_tokens")]
    pub output_tokens: u64,
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u64,
    #[serde(
        default,
        alias = "cache_read_tokens",
        alias = "cacheReadInputTokens",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_read_tokens: Option<u64>,
    #[serde(
        default,
        alias = "cache_write_tokens",
        alias = "cacheWriteInputTokens",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_write_tokens: Option<u64>,
    #[serde(
        default,
        rename = "estimatedCostUSD",
        alias = "estimated_cost_usd"
    )]
    pub estimated_cost_usd: f64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            ..Self::default()
        }
    }

    /// Fills the fields an upstream is allowed to omit: the total and the
    /// cost estimate. Values the upstream did report are kept.
    pub fn completed(mut self, pricing: &Pricing) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.input_tokens.saturating_add(self.output_tokens);
        }
        if self.estimated_cost_usd <= 0.0 {
            self.estimated_cost_usd = pricing.estimate(&self);
        }
        self
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_read_per_million: f64,
    pub cache_write_per_million: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_read_per_million: 0.3,
            cache_write_per_million: 3.75,
        }
    }
}

impl Pricing {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            input_per_million: read_f64("RELAY_PRICE_INPUT_PER_MTOK", defaults.input_per_million),
            output_per_million: read_f64(
                "RELAY_PRICE_OUTPUT_PER_MTOK",
                defaults.output_per_million,
            ),
            cache_read_per_million: read_f64(
                "RELAY_PRICE_CACHE_READ_PER_MTOK",
                defaults.cache_read_per_million,
            ),
            cache_write_per_million: read_f64(
                "RELAY_PRICE_CACHE_WRITE_PER_MTOK",
                defaults.cache_write_per_million,
            ),
        }
    }

    pub fn estimate(&self, usage: &Usage) -> f64 {
        let cost = usage.input_tokens as f64 * self.input_per_million
            + usage.output_tokens as f64 * self.output_per_million
            + usage.cache_read_tokens.unwrap_or_default() as f64 * self.cache_read_per_million
            + usage.cache_write_tokens.unwrap_or_default() as f64 * self.cache_write_per_million;
        // `cost` is in micro-dollars; report whole micro-dollars
        cost.round() / 1_000_000.0
    }
}
