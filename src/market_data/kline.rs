// ---------------------------------------------------------------------------
// Kline tick normalisation
// ---------------------------------------------------------------------------

use anyhow::{Context, Result};

use crate::types::UnifiedCandle;

/// Symbol and interval a kline tick belongs to, as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineSource {
    pub symbol: String,
    pub interval: String,
}

/// Parse a kline tick into a [`UnifiedCandle`].
///
/// Accepts the single-stream payload
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { ... } }
/// ```
/// as well as the combined-stream envelope `{ "stream": ..., "data": { ... } }`.
pub fn parse_kline_event(text: &str) -> Result<(KlineSource, UnifiedCandle)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let k = data.get("k").context("missing field k")?;

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();
    let interval = k["i"].as_str().context("missing field k.i")?.to_string();

    let candle = UnifiedCandle {
        open_time: parse_i64(&k["t"], "k.t")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        base_volume: parse_string_f64(&k["v"], "k.v")?,
        close_time: parse_i64(&k["T"], "k.T")?,
        quote_volume: parse_string_f64(&k["q"], "k.q")?,
        trade_count: parse_string_f64(&k["n"], "k.n")? as u64,
        taker_buy_base_volume: parse_string_f64(&k["V"], "k.V")?,
        taker_buy_quote_volume: parse_string_f64(&k["Q"], "k.Q")?,
    };

    Ok((KlineSource { symbol, interval }, candle))
}

/// Binance sends most numeric values as JSON strings.
pub fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    let parsed = match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}"))?,
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    };
    if !parsed.is_finite() {
        anyhow::bail!("field {name} is not finite");
    }
    Ok(parsed)
}

fn parse_i64(val: &serde_json::Value, name: &str) -> Result<i64> {
    match val.as_i64() {
        Some(v) => Ok(v),
        None => Ok(parse_string_f64(val, name)? as i64),
    }
}
