// =============================================================================
// Shared types used across the QFlow market service
// =============================================================================

use serde::{Deserialize, Serialize};

/// Number of columns in the compact candle wire format.
pub const UNIFIED_CANDLE_FIELDS: usize = 11;

/// One OHLCV bar in the exchange-neutral layout shared by the REST and
/// WebSocket transports.
///
/// On the wire a candle is an 11-element number array:
///   [0] openTime (ms), [1] open, [2] high, [3] low, [4] close,
///   [5] baseVolume, [6] closeTime (ms), [7] quoteVolume, [8] tradeCount,
///   [9] takerBuyBaseVolume, [10] takerBuyQuoteVolume
///
/// Identity for upsert purposes is `open_time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; UNIFIED_CANDLE_FIELDS]", into = "[f64; UNIFIED_CANDLE_FIELDS]")]
pub struct UnifiedCandle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub close_time: i64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub taker_buy_base_volume: f64,
    pub taker_buy_quote_volume: f64,
}

impl From<[f64; UNIFIED_CANDLE_FIELDS]> for UnifiedCandle {
    fn from(v: [f64; UNIFIED_CANDLE_FIELDS]) -> Self {
        Self {
            open_time: v[0] as i64,
            open: v[1],
            high: v[2],
            low: v[3],
            close: v[4],
            base_volume: v[5],
            close_time: v[6] as i64,
            quote_volume: v[7],
            trade_count: v[8] as u64,
            taker_buy_base_volume: v[9],
            taker_buy_quote_volume: v[10],
        }
    }
}

impl From<UnifiedCandle> for [f64; UNIFIED_CANDLE_FIELDS] {
    fn from(c: UnifiedCandle) -> Self {
        [
            c.open_time as f64,
            c.open,
            c.high,
            c.low,
            c.close,
            c.base_volume,
            c.close_time as f64,
            c.quote_volume,
            c.trade_count as f64,
            c.taker_buy_base_volume,
            c.taker_buy_quote_volume,
        ]
    }
}

/// Identity of a cached candle window and of a live stream. Two requests with
/// the same triple always observe the same buffer.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    pub symbol: String,
    pub interval: String,
    pub limit: usize,
}

impl CacheKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>, limit: usize) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            limit,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.symbol, self.interval, self.limit)
    }
}

/// A tradable perpetual market advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualMarket {
    pub symbol: String,
    pub label: String,
    pub description: String,
}
