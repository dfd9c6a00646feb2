//! Usage/activity logs.
//!
//! Grounded in [`crate::client_wrapper::TokenUsage`] and an agentic loop's per-turn accumulation
//! over tool iterations, generalized into a bounded ring buffer that tracks
//! `(agent, model, input_tokens, output_tokens)` per call and computes cost via a model-price
//! lookup table.

use crate::client_wrapper::TokenUsage;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Dollars-per-million-tokens for a given model. Unknown models fall back to
/// [`DEFAULT_PRICE`], a deliberately conservative (expensive) estimate so unaccounted spend is
/// never silently under-reported.
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const DEFAULT_PRICE: ModelPrice = ModelPrice {
    input_per_million: 15.0,
    output_per_million: 75.0,
};

/// One recorded LLM call.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub agent_id: String,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost_usd: f64,
    pub at: DateTime<Utc>,
}

/// Aggregate spend, grouped by either agent id or model name.
#[derive(Debug, Clone, Default)]
pub struct UsageRollup {
    pub calls: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost_usd: f64,
}

struct Inner {
    entries: VecDeque<UsageEntry>,
    capacity: usize,
    prices: HashMap<String, ModelPrice>,
}

/// Bounded ring buffer of [`UsageEntry`] plus rollups by agent and by model.
pub struct UsageLog {
    inner: Mutex<Inner>,
}

impl UsageLog {
    pub fn new(capacity: usize) -> Self {
        UsageLog {
            inner: Mutex::new(Inner {
                    entries: VecDeque::with_capacity(capacity),
                    capacity,
                    prices: HashMap::new(),
            }),
        }
    }

    pub fn set_price(&self, model: impl Into<String>, price: ModelPrice) {
        self.inner.lock().unwrap().prices.insert(model.into(), price);
    }

    fn price_for(prices: &HashMap<String, ModelPrice>, model: &str) -> ModelPrice {
        prices.get(model).copied().unwrap_or(DEFAULT_PRICE)
    }

    /// Record one call's token usage, evicting the oldest entry once `capacity` is exceeded.
    pub fn record(&self, agent_id: &str, model: &str, usage: &TokenUsage) {
        let mut inner = self.inner.lock().unwrap();
        let price = Self::price_for(&inner.prices, model);
        let cost_usd = usage.input_tokens as f64 / 1_000_000.0 * price.input_per_million
        + usage.output_tokens as f64 / 1_000_000.0 * price.output_per_million;
        let capacity = inner.capacity;
        if inner.entries.len() >= capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(UsageEntry {
                agent_id: agent_id.to_string(),
                model: model.to_string(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost_usd,
                at: Utc::now(),
        });
    }

    pub fn rollup_by_agent(&self) -> HashMap<String, UsageRollup> {
        let inner = self.inner.lock().unwrap();
        let mut out: HashMap<String, UsageRollup> = HashMap::new();
        for entry in &inner.entries {
            let rollup = out.entry(entry.agent_id.clone()).or_default();
            rollup.calls += 1;
            rollup.input_tokens += entry.input_tokens;
            rollup.output_tokens += entry.output_tokens;
            rollup.cost_usd += entry.cost_usd;
        }
        out
    }

    pub fn rollup_by_model(&self) -> HashMap<String, UsageRollup> {
        let inner = self.inner.lock().unwrap();
        let mut out: HashMap<String, UsageRollup> = HashMap::new();
        for entry in &inner.entries {
            let rollup = out.entry(entry.model.clone()).or_default();
            rollup.calls += 1;
            rollup.input_tokens += entry.input_tokens;
            rollup.output_tokens += entry.output_tokens;
            rollup.cost_usd += entry.cost_usd;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let log = UsageLog::new(2);
        for i in 0..3 {
            log.record(
                "a1",
                "gpt",
                &TokenUsage {
                    input_tokens: i,
                    output_tokens: i,
                    total_tokens: 2 * i,
                },
            );
        }
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn unknown_model_uses_conservative_default_price() {
        let log = UsageLog::new(10);
        log.record(
            "a1",
            "some-unpriced-model",
            &TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 1_000_000,
                total_tokens: 2_000_000,
            },
        );
        let rollup = log.rollup_by_agent();
        let a1 = &rollup["a1"];
        assert_eq!(a1.cost_usd, DEFAULT_PRICE.input_per_million + DEFAULT_PRICE.output_per_million);
    }

    #[test]
    fn configured_price_overrides_default() {
        let log = UsageLog::new(10);
        log.set_price(
            "cheap-model",
            ModelPrice {
                input_per_million: 1.0,
                output_per_million: 2.0,
            },
        );
        log.record(
            "a1",
            "cheap-model",
            &TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 1_000_000,
                total_tokens: 2_000_000,
            },
        );
        let rollup = log.rollup_by_model();
        assert_eq!(rollup["cheap-model"].cost_usd, 3.0);
    }

    #[test]
    fn rollup_by_agent_aggregates_across_calls() {
        let log = UsageLog::new(10);
        for _ in 0..3 {
            log.record(
                "a1",
                "gpt",
                &TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    total_tokens: 150,
                },
            );
        }
        let rollup = log.rollup_by_agent();
        assert_eq!(rollup["a1"].calls, 3);
        assert_eq!(rollup["a1"].input_tokens, 300);
    }
}
