// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// SMA_t = (close_{t-period+1} + ... + close_t) / period
//
// Computed with a rolling sum so the whole series is O(n).
// =============================================================================

/// Compute the SMA series for `closes` over a look-back `period`.
///
/// Each output element corresponds to a close starting at index `period - 1`,
/// so `result[i]` is the average ending at `closes[i + period - 1]`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period` => empty vec
pub fn calculate_sma(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let divisor = period as f64;
    let mut result = Vec::with_capacity(closes.len() - period + 1);

    let mut sum: f64 = closes[..period].iter().sum();
    result.push(sum / divisor);

    for (incoming, outgoing) in closes[period..].iter().zip(closes) {
        sum += incoming - outgoing;
        result.push(sum / divisor);
    }

    result
}
