// =============================================================================
// Backtest performance metrics
// =============================================================================

use serde::{Deserialize, Serialize};

use super::engine::Trade;
use crate::types::UnifiedCandle;

const MS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0 * 1000.0;
const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const INFINITE_MARKER: &str = "∞";

/// One labelled row of the metrics table, value already formatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRow {
    pub label: String,
    pub value: String,
}

impl MetricRow {
    fn new(label: &str, value: String) -> Self {
        Self {
            label: label.to_string(),
            value,
        }
    }
}

/// Aggregate statistics over a list of closed trades.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerformanceMetrics {
    pub trade_count: usize,
    pub total_return: f64,
    pub cagr: f64,
    /// Largest peak-to-trough decline of the equity curve, as a positive fraction.
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
}

impl PerformanceMetrics {
    /// `candles` spans the backtest window and is only used for its time range.
    pub fn compute(trades: &[Trade], candles: &[UnifiedCandle]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let curve = equity_curve(trades);
        let final_equity = curve.last().copied().unwrap_or(1.0);
        let total_return = final_equity - 1.0;

        let span_ms = match (candles.first(), candles.last()) {
            (Some(first), Some(last)) => (last.open_time - first.open_time) as f64,
            _ => 0.0,
        };
        let years = (span_ms / MS_PER_YEAR).max(1.0 / 365.0);
        let cagr = (1.0 + total_return).powf(1.0 / years) - 1.0;

        let returns: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let wins = returns.iter().filter(|r| **r > 0.0).count();

        let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
        let gross_loss: f64 = returns.iter().filter(|r| **r <= 0.0).map(|r| r.abs()).sum();
        let profit_factor = if gross_loss == 0.0 {
            gross_profit
        } else {
            gross_profit / gross_loss
        };

        Self {
            trade_count: trades.len(),
            total_return,
            cagr,
            max_drawdown: max_drawdown(&curve),
            sharpe: sharpe_ratio(&returns),
            win_rate: wins as f64 / trades.len() as f64,
            profit_factor,
        }
    }

    /// Display rows in fixed order. With no trades every value is neutral.
    pub fn to_rows(&self) -> Vec<MetricRow> {
        if self.trade_count == 0 {
            return vec![
                MetricRow::new("Total Return", "0%".into()),
                MetricRow::new("CAGR", "0%".into()),
                MetricRow::new("Max Drawdown", "0%".into()),
                MetricRow::new("Sharpe", "0".into()),
                MetricRow::new("Win Rate", "0%".into()),
                MetricRow::new("Profit Factor", "0".into()),
            ];
        }

        vec![
            MetricRow::new("Total Return", format_percent(self.total_return)),
            MetricRow::new("CAGR", format_percent(self.cagr)),
            MetricRow::new("Max Drawdown", format_percent(-self.max_drawdown)),
            MetricRow::new("Sharpe", format_decimal(self.sharpe)),
            MetricRow::new("Win Rate", format_percent(self.win_rate)),
            MetricRow::new("Profit Factor", format_decimal(self.profit_factor)),
        ]
    }
}

/// Compounded equity after each trade, starting from 1.0.
fn equity_curve(trades: &[Trade]) -> Vec<f64> {
    trades
        .iter()
        .scan(1.0_f64, |equity, trade| {
            *equity *= 1.0 + trade.pnl;
            Some(*equity)
        })
        .collect()
}

fn max_drawdown(curve: &[f64]) -> f64 {
    let Some(&first) = curve.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut worst = 0.0_f64;
    for &value in curve {
        peak = peak.max(value);
        if peak > 0.0 {
            worst = worst.max((peak - value) / peak);
        }
    }
    worst
}

/// Annualised ratio of mean to sample standard deviation of per-trade returns.
fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
    let std = variance.sqrt();
    if std == 0.0 {
        0.0
    } else {
        mean / std * TRADING_DAYS_PER_YEAR.sqrt()
    }
}

fn format_percent(value: f64) -> String {
    if !value.is_finite() {
        return INFINITE_MARKER.to_string();
    }
    // Adding 0.0 folds -0.0 into 0.0 so a flat curve never shows "-0.00%".
    format!("{:.2}%", value * 100.0 + 0.0)
}

fn format_decimal(value: f64) -> String {
    if !value.is_finite() {
        return INFINITE_MARKER.to_string();
    }
    format!("{:.2}", value + 0.0)
}
