//! Cost estimation from token usage.
//!
//! Prices are configured in USD per million tokens and converted once into integer
//! nano-dollars per million tokens, so estimates are exact and deterministic. Unknown models
//! fail closed with [`PricingUnavailable`] rather than being billed as zero.

use crate::provider::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

const NANOS_PER_USD: f64 = 1_000_000_000.0;
const TOKENS_PER_PRICE_UNIT: u128 = 1_000_000;

/// Price of one model in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cached_input: f64,
}

impl ModelPrice {
    pub fn new(input: f64, output: f64, cached_input: f64) -> Self {
        Self {
            input,
            output,
            cached_input,
        }
    }
}

/// The `pricing` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub models: BTreeMap<String, ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let models = [
            ("gpt-5.2-pro", ModelPrice::new(21.00, 168.00, 0.0)),
            ("gpt-5.2", ModelPrice::new(1.75, 14.00, 0.175)),
            ("gpt-5-mini", ModelPrice::new(0.25, 2.00, 0.025)),
        ]
        .into_iter()
        .map(|(id, price)| (id.to_string(), price))
        .collect();

        Self { models }
    }
}

/// An amount of money in nano-dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cost(pub u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub fn from_usd(usd: f64) -> Self {
        Cost((usd.max(0.0) * NANOS_PER_USD).round() as u64)
    }

    pub fn nanos(self) -> u64 {
        self.0
    }

    pub fn as_usd(self) -> f64 {
        self.0 as f64 / NANOS_PER_USD
    }
}

impl std::ops::Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.5}", self.as_usd())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("no price configured for model '{model}'")]
pub struct PricingUnavailable {
    pub model: String,
}

/// Per-million-token rates in nano-dollars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rates {
    input: u64,
    output: u64,
    cached_input: u64,
}

impl From<ModelPrice> for Rates {
    fn from(price: ModelPrice) -> Self {
        Self {
            input: Cost::from_usd(price.input).0,
            output: Cost::from_usd(price.output).0,
            cached_input: Cost::from_usd(price.cached_input).0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTable {
    rates: BTreeMap<String, Rates>,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}

impl PriceTable {
    pub fn from_config(config: &PricingConfig) -> Self {
        let rates = config
            .models
            .iter()
            .map(|(id, price)| (id.clone(), Rates::from(*price)))
            .collect();
        Self { rates }
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.rates.keys().map(String::as_str)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.lookup(model).is_some()
    }

    /// Exact match, else the longest key that is a `-`-delimited prefix of `model`.
    fn lookup(&self, model: &str) -> Option<&Rates> {
        if let Some(rates) = self.rates.get(model) {
            return Some(rates);
        }

        self.rates
            .iter()
            .filter(|(key, _)| {
                model
                    .strip_prefix(key.as_str())
                    .is_some_and(|rest| rest.starts_with('-'))
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(_, rates)| rates)
    }

    /// Cost of one turn. Cached input tokens are billed at the cached rate and excluded
    /// from the regular input charge.
    pub fn estimate(&self, model: &str, usage: &TokenUsage) -> Result<Cost, PricingUnavailable> {
        let rates = self.lookup(model).ok_or_else(|| PricingUnavailable {
            model: model.to_string(),
        })?;

        let cached = usage.cached_input_tokens.min(usage.input_tokens);
        let uncached = usage.input_tokens - cached;

        let scaled = uncached as u128 * rates.input as u128
            + cached as u128 * rates.cached_input as u128
            + usage.output_tokens as u128 * rates.output as u128;

        let nanos = scaled / TOKENS_PER_PRICE_UNIT;
        Ok(Cost(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

/// Result of pricing one sealed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnCost {
    Priced { cost: Cost },
    Unavailable { model: String },
}

impl From<Result<Cost, PricingUnavailable>> for TurnCost {
    fn from(result: Result<Cost, PricingUnavailable>) -> Self {
        match result {
            Ok(cost) => TurnCost::Priced { cost },
            Err(PricingUnavailable { model }) => TurnCost::Unavailable { model },
        }
    }
}

impl fmt::Display for TurnCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnCost::Priced { cost } => cost.fmt(f),
            TurnCost::Unavailable { model } => write!(f, "n/a ({model})"),
        }
    }
}

/// Session-level cost bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostLedger {
    pub session_total: Cost,
    pub last_turn: Option<TurnCost>,
    pub unpriced_turns: u32,
}

impl CostLedger {
    pub fn record(&mut self, cost: &TurnCost) {
        match cost {
            TurnCost::Priced { cost } => self.session_total += *cost,
            TurnCost::Unavailable { .. } => self.unpriced_turns += 1,
        }
        self.last_turn = Some(cost.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table() -> PriceTable {
        let mut config = PricingConfig::default();
        config
            .models
            .insert("m1".to_string(), ModelPrice::new(2.0, 6.0, 0.5));
        PriceTable::from_config(&config)
    }

    #[test]
    fn test_estimate_follows_formula() {
        let cost = table().estimate("m1", &TokenUsage::new(120, 340)).unwrap();
        assert_eq!(cost, Cost(2_280_000));
        assert_eq!(cost.to_string(), "$0.00228");
    }

    #[test]
    fn test_cached_tokens_billed_at_cached_rate() {
        let usage = TokenUsage::new(1_000_000, 0).with_cached(400_000);
        let cost = table().estimate("m1", &usage).unwrap();
        // 600k * $2/M + 400k * $0.5/M
        assert_eq!(cost, Cost::from_usd(1.4));
    }

    #[test]
    fn test_unknown_model_fails_closed() {
        let err = table()
            .estimate("mystery-model", &TokenUsage::new(1, 1))
            .unwrap_err();
        assert_eq!(err.model, "mystery-model");
    }

    #[test]
    fn test_dated_snapshot_uses_longest_prefix() {
        let table = table();
        let usage = TokenUsage::new(1_000_000, 0);
        assert_eq!(
            table.estimate("gpt-5.2-2025-12-11", &usage).unwrap(),
            Cost::from_usd(1.75)
        );
        assert_eq!(
            table.estimate("gpt-5.2-pro-2025-12-11", &usage).unwrap(),
            Cost::from_usd(21.0)
        );
        assert!(table.estimate("gpt-5.2x", &usage).is_err());
    }

    #[test]
    fn test_ledger_excludes_unpriced_turns() {
        let mut ledger = CostLedger::default();
        ledger.record(&TurnCost::Priced { cost: Cost(10) });
        ledger.record(&TurnCost::Unavailable {
            model: "x".into(),
        });
        ledger.record(&TurnCost::Priced { cost: Cost(5) });

        assert_eq!(ledger.session_total, Cost(15));
        assert_eq!(ledger.unpriced_turns, 1);
        assert_eq!(ledger.last_turn, Some(TurnCost::Priced { cost: Cost(5) }));
    }

    proptest! {
        #[test]
        fn prop_estimate_is_deterministic_and_monotonic(
            input in 0u64..5_000_000,
            output in 0u64..5_000_000,
            extra in 0u64..10_000,
        ) {
            let table = table();
            let usage = TokenUsage::new(input, output);
            let a = table.estimate("gpt-5-mini", &usage).unwrap();
            let b = table.estimate("gpt-5-mini", &usage).unwrap();
            prop_assert_eq!(a, b);

            let more = TokenUsage::new(input, output + extra);
            prop_assert!(table.estimate("gpt-5-mini", &more).unwrap() >= a);
        }
    }
}
