pub mod candle_cache;
pub mod kline;
pub mod stream_manager;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::types::{PerpetualMarket, UnifiedCandle};

pub use candle_cache::CandleCache;
pub use stream_manager::{StreamManager, StreamStatus, Subscription};

/// Raw kline ticks as delivered by the upstream socket. The stream ends when
/// the socket closes; an `Err` item is a transport failure. Dropping the
/// stream releases the connection.
pub type KlineStream = BoxStream<'static, anyhow::Result<String>>;

/// The upstream exchange as seen by the core: a REST snapshot call and a
/// streaming kline feed.
pub trait MarketSource: Send + Sync + 'static {
    fn supported_intervals(&self) -> Vec<String>;

    fn perpetual_markets(&self) -> Vec<PerpetualMarket>;

    /// Fetch the `limit` most recent candles, oldest first.
    fn fetch_candles<'a>(
        &'a self,
        symbol: &'a str,
        interval: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, anyhow::Result<Vec<UnifiedCandle>>>;

    /// Open a kline subscription for `(symbol, interval)`.
    fn subscribe_kline<'a>(
        &'a self,
        symbol: &'a str,
        interval: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<KlineStream>>;
}

/// Messages pushed to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketMessage {
    /// Full current buffer. Always the first message a subscriber sees.
    Snapshot {
        symbol: String,
        interval: String,
        candles: Vec<UnifiedCandle>,
    },
    /// One upserted candle.
    Update {
        symbol: String,
        interval: String,
        candle: UnifiedCandle,
    },
}

impl MarketMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Update { .. } => "update",
        }
    }
}
