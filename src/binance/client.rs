// =============================================================================
// Binance public market-data client: REST klines + kline WebSocket
// =============================================================================
//
// Only unauthenticated endpoints are used. HTTP proxies configured through
// HTTPS_PROXY / HTTP_PROXY are picked up by reqwest automatically.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::market_data::kline::parse_string_f64;
use crate::market_data::{KlineStream, MarketSource};
use crate::types::{PerpetualMarket, UnifiedCandle, UNIFIED_CANDLE_FIELDS};

/// Kline intervals accepted by the exchange.
pub const SUPPORTED_INTERVALS: &[&str] = &[
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

/// (symbol, base asset, long name) of the advertised perpetual markets.
const PERPETUAL_MARKETS: &[(&str, &str, &str)] = &[
    ("BTCUSDT", "BTC", "Bitcoin"),
    ("ETHUSDT", "ETH", "Ethereum"),
    ("BNBUSDT", "BNB", "BNB"),
    ("SOLUSDT", "SOL", "Solana"),
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Binance spot market-data client.
#[derive(Clone)]
pub struct BinanceClient {
    rest_url: String,
    ws_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    /// Create a client against the given REST and WebSocket base URLs.
    pub fn new(rest_url: impl Into<String>, ws_url: impl Into<String>) -> Result<Self> {
        let rest_url = rest_url.into().trim_end_matches('/').to_string();
        let ws_url = ws_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        debug!(rest_url = %rest_url, ws_url = %ws_url, "BinanceClient initialised");

        Ok(Self {
            rest_url,
            ws_url,
            client,
        })
    }

    /// GET /api/v3/klines
    ///
    /// Rows arrive oldest first as arrays whose first 11 entries map onto
    /// [`UnifiedCandle`]; prices and volumes are JSON strings.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<UnifiedCandle>> {
        let url = format!("{}/api/v3/klines", self.rest_url);
        let limit = limit.to_string();

        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("interval", interval), ("limit", limit.as_str())])
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let rows = body.as_array().context("klines response is not an array")?;
        let candles = rows
            .iter()
            .map(parse_kline_row)
            .collect::<Result<Vec<_>>>()?;

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Open the raw kline stream for `(symbol, interval)`.
    ///
    /// Yields each text frame unparsed. Control frames are skipped; the
    /// stream ends when the server closes the socket.
    pub async fn subscribe_kline(&self, symbol: &str, interval: &str) -> Result<KlineStream> {
        let url = kline_stream_url(&self.ws_url, symbol, interval);
        info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to kline WebSocket")?;

        info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");

        let frames = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    warn!(len = bytes.len(), "ignoring binary kline frame");
                    None
                }
                // Ping / Pong / Close are handled by tungstenite.
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::Error::new(e).context("kline WebSocket read error"))),
            }
        });

        Ok(frames.boxed())
    }
}

impl MarketSource for BinanceClient {
    fn supported_intervals(&self) -> Vec<String> {
        SUPPORTED_INTERVALS.iter().map(|s| s.to_string()).collect()
    }

    fn perpetual_markets(&self) -> Vec<PerpetualMarket> {
        PERPETUAL_MARKETS
            .iter()
            .map(|(symbol, base, name)| PerpetualMarket {
                symbol: symbol.to_string(),
                label: format!("{base} / USDT"),
                description: format!("{name} perpetual"),
            })
            .collect()
    }

    fn fetch_candles<'a>(
        &'a self,
        symbol: &'a str,
        interval: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UnifiedCandle>>> {
        self.get_klines(symbol, interval, limit).boxed()
    }

    fn subscribe_kline<'a>(
        &'a self,
        symbol: &'a str,
        interval: &'a str,
    ) -> BoxFuture<'a, Result<KlineStream>> {
        BinanceClient::subscribe_kline(self, symbol, interval).boxed()
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("rest_url", &self.rest_url)
            .field("ws_url", &self.ws_url)
            .finish()
    }
}

fn kline_stream_url(ws_url: &str, symbol: &str, interval: &str) -> String {
    format!("{ws_url}/ws/{}@kline_{interval}", symbol.to_lowercase())
}

/// Normalise one `/api/v3/klines` row. Trailing fields beyond the 11th are
/// ignored.
fn parse_kline_row(row: &serde_json::Value) -> Result<UnifiedCandle> {
    let arr = row.as_array().context("kline entry is not an array")?;
    if arr.len() < UNIFIED_CANDLE_FIELDS {
        anyhow::bail!("kline entry has {} fields, expected {}", arr.len(), UNIFIED_CANDLE_FIELDS);
    }

    let mut fields = [0.0_f64; UNIFIED_CANDLE_FIELDS];
    for (idx, (slot, value)) in fields.iter_mut().zip(arr).enumerate() {
        *slot = parse_string_f64(value, &format!("kline[{idx}]"))?;
    }
    Ok(UnifiedCandle::from(fields))
}
