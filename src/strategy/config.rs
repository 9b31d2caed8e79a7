// =============================================================================
// Strategy configuration: the single validation point for strategy payloads
// =============================================================================
//
// Strategy payloads arrive from the node-graph editor as loosely-typed JSON.
// `StrategyConfig::resolve` is the only place that interprets them: every
// numeric field falls back to its default when missing or malformed, and is
// clamped to a floor. Resolution never fails.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Floor applied to the fast moving-average period.
pub const MIN_SHORT_PERIOD: usize = 3;
/// Floor applied to the slow moving-average period.
pub const MIN_LONG_PERIOD: usize = 5;
/// Floor applied to the take-profit and stop-loss fractions.
pub const MIN_EXIT_PCT: f64 = 0.001;

fn default_short_period() -> usize {
    9
}

fn default_long_period() -> usize {
    26
}

fn default_take_profit_pct() -> f64 {
    0.03
}

fn default_stop_loss_pct() -> f64 {
    0.015
}

/// A strategy as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPayload {
    pub id: String,
    pub code: String,
    /// Editor graph. May carry crossover parameters directly or under a
    /// nested `config` object.
    #[serde(default)]
    pub nodes: Value,
}

/// Resolved dual-moving-average crossover parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_short_period")]
    pub short_period: usize,

    #[serde(default = "default_long_period")]
    pub long_period: usize,

    /// Take-profit distance above entry, as a fraction (0.03 = 3 %).
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Stop-loss distance below entry, as a fraction.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            short_period: default_short_period(),
            long_period: default_long_period(),
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
        }
    }
}

impl StrategyConfig {
    /// Resolve crossover parameters from a strategy's `nodes` payload.
    ///
    /// Reads `shortPeriod`, `longPeriod`, `takeProfitPct` and `stopLossPct`
    /// from `nodes.config` when present, otherwise from `nodes` itself. Only
    /// finite JSON numbers and numeric strings are accepted; anything else
    /// uses the value from `defaults`. Periods are floored to integers.
    pub fn resolve(nodes: &Value, defaults: &StrategyConfig) -> Self {
        let source = match nodes.get("config") {
            Some(config) if nodes.is_object() => config,
            _ => nodes,
        };

        let field = |name: &str| source.get(name).and_then(parse_number);

        Self {
            short_period: clamp_period(
                field("shortPeriod").unwrap_or(defaults.short_period as f64),
                MIN_SHORT_PERIOD,
            ),
            long_period: clamp_period(
                field("longPeriod").unwrap_or(defaults.long_period as f64),
                MIN_LONG_PERIOD,
            ),
            take_profit_pct: clamp_pct(field("takeProfitPct").unwrap_or(defaults.take_profit_pct)),
            stop_loss_pct: clamp_pct(field("stopLossPct").unwrap_or(defaults.stop_loss_pct)),
        }
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn clamp_period(value: f64, floor: usize) -> usize {
    let value = value.floor();
    if value < floor as f64 {
        floor
    } else {
        value as usize
    }
}

fn clamp_pct(value: f64) -> f64 {
    if value.is_finite() {
        value.max(MIN_EXIT_PCT)
    } else {
        MIN_EXIT_PCT
    }
}
