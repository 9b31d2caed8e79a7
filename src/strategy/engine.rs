// =============================================================================
// Strategy Engine: dual-SMA crossover backtest
// =============================================================================
//
// Walks the candle series once, holding at most one long position:
//   - flat and fast SMA above slow SMA        → enter at the close
//   - in position, high reaches take-profit   → exit at the take-profit price
//   - in position, low reaches stop-loss      → exit at the stop-loss price
//   - in position, fast SMA below slow SMA    → exit at the close
//
// Exits are checked in that order and never on the entry bar. A position
// still open after the last bar is discarded.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::{StrategyConfig, StrategyPayload};
use super::metrics::{MetricRow, PerformanceMetrics};
use crate::error::BacktestError;
use crate::indicators::sma::calculate_sma;
use crate::types::UnifiedCandle;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitType {
    TakeProfit,
    StopLoss,
    Signal,
}

/// A closed round trip. Times are candle open times in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// `(exit - entry) / entry`
    pub pnl: f64,
    pub exit_type: ExitType,
    pub label: String,
}

/// Chart annotation for a protective exit. `time` is in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeMarker {
    pub time: i64,
    #[serde(rename = "type")]
    pub kind: ExitType,
    pub label: String,
}

/// Entry or exit point for the price overlay. `time` is in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalPoint {
    pub time: i64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub strategy_id: String,
    pub markers: Vec<TradeMarker>,
    pub signals: Vec<SignalPoint>,
    pub metrics: Vec<MetricRow>,
}

/// Acknowledgement returned when a strategy is compiled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledStrategy {
    #[serde(flatten)]
    pub payload: StrategyPayload,
    pub compiled_at: String,
}

struct OpenPosition {
    entry_time: i64,
    entry_price: f64,
}

/// Stateless backtester. Holds only the fallback parameters used when a
/// payload omits them.
#[derive(Debug, Clone, Default)]
pub struct StrategyEngine {
    defaults: StrategyConfig,
}

impl StrategyEngine {
    pub fn new(defaults: StrategyConfig) -> Self {
        Self { defaults }
    }

    /// Stamp a payload with its compile time. The strategy graph itself is
    /// interpreted lazily by [`StrategyEngine::backtest`].
    pub fn compile(&self, payload: StrategyPayload) -> CompiledStrategy {
        let compiled_at = chrono::Utc::now().to_rfc3339();
        debug!(strategy_id = %payload.id, %compiled_at, "Strategy compiled");
        CompiledStrategy {
            payload,
            compiled_at,
        }
    }

    /// Run the crossover backtest over `candles` (oldest first).
    ///
    /// Deterministic: the same payload and candles always yield the same
    /// report.
    pub fn backtest(
        &self,
        payload: &StrategyPayload,
        candles: &[UnifiedCandle],
    ) -> Result<BacktestReport, BacktestError> {
        let config = StrategyConfig::resolve(&payload.nodes, &self.defaults);

        if candles.len() < config.long_period {
            return Err(BacktestError::InsufficientData {
                have: candles.len(),
                need: config.long_period,
            });
        }

        let trades = simulate_trades(candles, &config, &payload.id);
        let metrics = PerformanceMetrics::compute(&trades, candles);

        info!(
            strategy_id = %payload.id,
            candles = candles.len(),
            short = config.short_period,
            long = config.long_period,
            trades = trades.len(),
            total_return = metrics.total_return,
            "Backtest complete"
        );

        Ok(BacktestReport {
            strategy_id: payload.id.clone(),
            markers: build_markers(&trades),
            signals: build_signals(&trades),
            metrics: metrics.to_rows(),
        })
    }
}

/// Replay the crossover rules over `candles` and return every closed trade.
pub fn simulate_trades(
    candles: &[UnifiedCandle],
    config: &StrategyConfig,
    strategy_id: &str,
) -> Vec<Trade> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let short_sma = calculate_sma(&closes, config.short_period);
    let long_sma = calculate_sma(&closes, config.long_period);

    let short_offset = config.short_period - 1;
    let long_offset = config.long_period - 1;
    let warmup = short_offset.max(long_offset);

    let mut trades = Vec::new();
    let mut position: Option<OpenPosition> = None;

    for (idx, candle) in candles.iter().enumerate().skip(warmup) {
        let (Some(&short), Some(&long)) = (
            short_sma.get(idx - short_offset),
            long_sma.get(idx - long_offset),
        ) else {
            continue;
        };

        let Some(open) = &position else {
            if short > long {
                position = Some(OpenPosition {
                    entry_time: candle.open_time,
                    entry_price: candle.close,
                });
            }
            continue;
        };

        let take_profit = open.entry_price * (1.0 + config.take_profit_pct);
        let stop_loss = open.entry_price * (1.0 - config.stop_loss_pct);

        let exit = if candle.high >= take_profit {
            Some((take_profit, ExitType::TakeProfit))
        } else if candle.low <= stop_loss {
            Some((stop_loss, ExitType::StopLoss))
        } else if short < long {
            Some((candle.close, ExitType::Signal))
        } else {
            None
        };

        if let Some((exit_price, exit_type)) = exit {
            trades.push(Trade {
                entry_time: open.entry_time,
                exit_time: candle.open_time,
                entry_price: open.entry_price,
                exit_price,
                pnl: (exit_price - open.entry_price) / open.entry_price,
                exit_type,
                label: format!("{strategy_id}-{}", trades.len()),
            });
            position = None;
        }
    }

    trades
}

fn to_seconds(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

fn build_markers(trades: &[Trade]) -> Vec<TradeMarker> {
    trades
        .iter()
        .filter(|t| t.exit_type != ExitType::Signal)
        .map(|t| TradeMarker {
            time: to_seconds(t.exit_time),
            kind: t.exit_type,
            label: t.label.clone(),
        })
        .collect()
}

fn build_signals(trades: &[Trade]) -> Vec<SignalPoint> {
    trades
        .iter()
        .flat_map(|t| {
            [
                SignalPoint {
                    time: to_seconds(t.entry_time),
                    price: t.entry_price,
                },
                SignalPoint {
                    time: to_seconds(t.exit_time),
                    price: t.exit_price,
                },
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MINUTE_MS: i64 = 60_000;

    fn bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> UnifiedCandle {
        let open_time = 1_700_000_000_000 + i as i64 * MINUTE_MS;
        UnifiedCandle {
            open_time,
            open,
            high,
            low,
            close,
            base_volume: 1.0,
            close_time: open_time + MINUTE_MS - 1,
            quote_volume: close,
            trade_count: 1,
            taker_buy_base_volume: 0.5,
            taker_buy_quote_volume: close / 2.0,
        }
    }

    fn flat_bar(i: usize, close: f64) -> UnifiedCandle {
        bar(i, close, close, close, close)
    }

    fn payload(nodes: serde_json::Value) -> StrategyPayload {
        StrategyPayload {
            id: "sma".into(),
            code: String::new(),
            nodes,
        }
    }

    fn fast_config() -> serde_json::Value {
        json!({ "config": { "shortPeriod": 3, "longPeriod": 5, "takeProfitPct": 0.03, "stopLossPct": 0.015 } })
    }

    fn fast() -> StrategyConfig {
        StrategyConfig::resolve(&fast_config(), &StrategyConfig::default())
    }

    #[test]
    fn rising_closes_enter_once_and_take_profit() {
        // Closes 100..110 rise 1 per bar, so the fast SMA leads from the
        // first fully-warmed bar onward.
        let candles: Vec<_> = (0..10).map(|i| flat_bar(i, 100.0 + i as f64)).collect();
        let trades = simulate_trades(&candles, &fast(), "sma");

        assert!(!trades.is_empty());
        let first = &trades[0];
        assert_eq!(first.entry_time, candles[4].open_time);
        assert!((first.entry_price - 104.0).abs() < f64::EPSILON);
        // 104 * 1.03 = 107.12, first reached by the close-108 bar.
        assert_eq!(first.exit_type, ExitType::TakeProfit);
        assert_eq!(first.exit_time, candles[8].open_time);
        assert!((first.exit_price - 107.12).abs() < 1e-9);
        assert!((first.pnl - 0.03).abs() < 1e-9);
        assert_eq!(first.label, "sma-0");
    }

    #[test]
    fn entry_bar_is_never_an_exit_bar() {
        // Entry bar's own high would satisfy take-profit.
        let mut candles: Vec<_> = (0..6).map(|i| flat_bar(i, 100.0 + i as f64)).collect();
        candles[4] = bar(4, 104.0, 200.0, 104.0, 104.0);
        let trades = simulate_trades(&candles, &fast(), "sma");
        assert!(trades.iter().all(|t| t.entry_time != t.exit_time));
    }

    #[test]
    fn take_profit_wins_when_both_levels_are_crossed() {
        let mut candles: Vec<_> = (0..5).map(|i| flat_bar(i, 100.0 + i as f64)).collect();
        // Entry at 104. Next bar spans both 107.12 and 102.44.
        candles.push(bar(5, 104.0, 110.0, 90.0, 105.0));
        let trades = simulate_trades(&candles, &fast(), "sma");
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_type, ExitType::TakeProfit);
        assert!((trades[0].exit_price - 104.0 * 1.03).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_exits_at_stop_price() {
        let mut candles: Vec<_> = (0..5).map(|i| flat_bar(i, 100.0 + i as f64)).collect();
        candles.push(bar(5, 104.0, 104.5, 100.0, 104.2));
        let trades = simulate_trades(&candles, &fast(), "sma");
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_type, ExitType::StopLoss);
        assert!((trades[0].exit_price - 104.0 * 0.985).abs() < 1e-9);
        assert!((trades[0].pnl + 0.015).abs() < 1e-9);
    }

    #[test]
    fn crossover_reversal_exits_at_close() {
        // Rise to enter, then fall gently so neither protective level is hit
        // before the fast SMA crosses under.
        let closes = [100.0, 101.0, 102.0, 103.0, 104.0, 103.5, 103.0, 102.6, 102.5];
        let candles: Vec<_> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| flat_bar(i, c))
            .collect();
        let trades = simulate_trades(&candles, &fast(), "sma");
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exit_type, ExitType::Signal);
        assert!(t.exit_price > 104.0 * 0.985);
        assert_eq!(
            t.exit_price,
            candles.iter().find(|c| c.open_time == t.exit_time).unwrap().close
        );
    }

    #[test]
    fn open_position_at_end_is_dropped() {
        let candles: Vec<_> = (0..6).map(|i| flat_bar(i, 100.0 + i as f64 * 0.1)).collect();
        let trades = simulate_trades(&candles, &fast(), "sma");
        assert!(trades.is_empty());
    }

    #[test]
    fn flat_series_produces_neutral_report() {
        let candles: Vec<_> = (0..40).map(|i| flat_bar(i, 100.0)).collect();
        let engine = StrategyEngine::default();
        let report = engine.backtest(&payload(json!({})), &candles).unwrap();
        assert!(report.markers.is_empty());
        assert!(report.signals.is_empty());
        let values: Vec<&str> = report.metrics.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, ["0%", "0%", "0%", "0", "0%", "0"]);
    }

    #[test]
    fn insufficient_candles_is_rejected() {
        let candles: Vec<_> = (0..4).map(|i| flat_bar(i, 100.0)).collect();
        let err = StrategyEngine::default()
            .backtest(&payload(fast_config()), &candles)
            .unwrap_err();
        assert_eq!(err, BacktestError::InsufficientData { have: 4, need: 5 });

        let err = StrategyEngine::default()
            .backtest(&payload(json!({})), &candles)
            .unwrap_err();
        assert_eq!(err, BacktestError::InsufficientData { have: 4, need: 26 });
    }

    #[test]
    fn report_contains_markers_and_signals() {
        let candles: Vec<_> = (0..10).map(|i| flat_bar(i, 100.0 + i as f64)).collect();
        let engine = StrategyEngine::default();
        let report = engine.backtest(&payload(fast_config()), &candles).unwrap();

        assert_eq!(report.strategy_id, "sma");
        let first = &report.markers[0];
        assert_eq!(first.kind, ExitType::TakeProfit);
        assert_eq!(first.label, "sma-0");
        assert_eq!(first.time, candles[8].open_time / 1000);

        assert_eq!(report.signals.len() % 2, 0);
        assert_eq!(report.signals[0].time, candles[4].open_time / 1000);
        assert!((report.signals[0].price - 104.0).abs() < f64::EPSILON);
        assert_eq!(report.metrics.len(), 6);
        assert_eq!(report.metrics[0].label, "Total Return");
    }

    #[test]
    fn backtest_is_deterministic() {
        let candles: Vec<_> = (0..120)
            .map(|i| {
                let c = 100.0 + (i as f64 / 5.0).sin() * 4.0;
                bar(i, c, c + 1.5, c - 1.5, c)
            })
            .collect();
        let engine = StrategyEngine::default();
        let p = payload(fast_config());
        let a = engine.backtest(&p, &candles).unwrap();
        let b = engine.backtest(&p, &candles).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn report_serialises_with_wire_names() {
        let candles: Vec<_> = (0..10).map(|i| flat_bar(i, 100.0 + i as f64)).collect();
        let report = StrategyEngine::default()
            .backtest(&payload(fast_config()), &candles)
            .unwrap();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["strategyId"], "sma");
        assert_eq!(value["markers"][0]["type"], "take-profit");
        assert!(value["signals"][0]["price"].is_number());
        assert_eq!(value["metrics"][0]["label"], "Total Return");
    }

    #[test]
    fn compile_stamps_payload() {
        let compiled = StrategyEngine::default().compile(payload(json!({ "a": 1 })));
        let value = serde_json::to_value(&compiled).unwrap();
        assert_eq!(value["id"], "sma");
        assert_eq!(value["nodes"]["a"], 1);
        assert!(chrono::DateTime::parse_from_rfc3339(value["compiledAt"].as_str().unwrap()).is_ok());
    }
}
