// =============================================================================
// Strategy Module: parameterised crossover backtesting
// =============================================================================

pub mod config;
pub mod engine;
pub mod metrics;

pub use config::{StrategyConfig, StrategyPayload};
pub use engine::{BacktestReport, StrategyEngine};
