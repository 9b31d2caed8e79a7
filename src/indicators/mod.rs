// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator series used by the backtest engine.

pub mod sma;
