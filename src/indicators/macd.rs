// =============================================================================
// Moving Average Convergence/Divergence (MACD)
// =============================================================================
//
// Formula:
//   MACD_t   = EMA(closes, fast)_t - EMA(closes, slow)_t
//   Signal_t = EMA(MACD series, signal_period)_t
//   Hist_t   = MACD_t - Signal_t
//
// Built on the already-kept `ema::calculate_ema` rather than re-deriving the
// EMA recurrence, the same "reuse the primitive" approach `ema_trend_aligned`
// takes for its own three-EMA stack.
// =============================================================================

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the full MACD series for `closes` using `fast`/`slow`/`signal`
/// periods (conventionally 12/26/9).
///
/// # Edge cases
/// - Any period `== 0`, or `fast >= slow`, => empty vec.
/// - Insufficient data for either EMA or for the signal line => empty vec.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Vec<Macd> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return Vec::new();
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return Vec::new();
    }

    // ema_fast is longer (starts earlier) than ema_slow by (slow - fast)
    // entries; align both series to the slow EMA's start index.
    let offset = ema_fast.len() - ema_slow.len();
    let macd_line: Vec<f64> = ema_fast[offset..]
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    if macd_line.len() < signal_period {
        return Vec::new();
    }

    let signal_line = calculate_ema(&macd_line, signal_period);
    if signal_line.is_empty() {
        return Vec::new();
    }

    let macd_offset = macd_line.len() - signal_line.len();
    macd_line[macd_offset..]
        .iter()
        .zip(signal_line.iter())
        .map(|(&m, &s)| Macd { macd: m, signal: s, histogram: m - s })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_when_fast_not_less_than_slow() {
        assert!(calculate_macd(&[1.0; 50], 26, 12, 9).is_empty());
    }

    #[test]
    fn empty_on_insufficient_data() {
        assert!(calculate_macd(&[1.0; 10], 12, 26, 9).is_empty());
    }

    #[test]
    fn flat_series_has_zero_histogram() {
        let closes = vec![100.0; 60];
        let macd = calculate_macd(&closes, 12, 26, 9);
        assert!(!macd.is_empty());
        let last = macd.last().unwrap();
        assert!(last.histogram.abs() < 1e-9);
    }

    #[test]
    fn rising_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let macd = calculate_macd(&closes, 12, 26, 9);
        let last = macd.last().unwrap();
        assert!(last.macd > 0.0, "fast EMA should lead slow EMA upward");
    }
}
