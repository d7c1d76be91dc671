// =============================================================================
// Money Flow Index (MFI) — "volume-weighted RSI"
// =============================================================================
//
// Formula (period `n`):
//   typical_price_t = (high_t + low_t + close_t) / 3
//   raw_money_flow_t = typical_price_t * volume_t
//   positive flow: typical_price_t > typical_price_{t-1}
//   negative flow: typical_price_t < typical_price_{t-1}
//   money_ratio = sum(positive flow, n) / sum(negative flow, n)
//   MFI = 100 - 100 / (1 + money_ratio)
//
// Thresholds: MFI > 80 => overbought, MFI < 20 => oversold.
// =============================================================================

/// Compute the MFI series over a rolling `period`-bar window. `highs`,
/// `lows`, `closes`, and `volumes` must be the same length.
///
/// # Edge cases
/// - `period == 0`, mismatched lengths, or fewer than `period + 1` bars
///   (one extra bar is needed to seed the first typical-price delta) =>
///   empty vec.
/// - A window with zero negative flow is clamped to MFI = 100.0 rather than
///   dividing by zero.
pub fn calculate_mfi(highs: &[f64], lows: &[f64], closes: &[f64], volumes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    if period == 0
        || highs.len() != n
        || lows.len() != n
        || volumes.len() != n
        || n < period + 1
    {
        return Vec::new();
    }

    let typical: Vec<f64> = (0..n).map(|i| (highs[i] + lows[i] + closes[i]) / 3.0).collect();
    let raw_flow: Vec<f64> = (0..n).map(|i| typical[i] * volumes[i]).collect();

    let mut result = Vec::with_capacity(n - period);
    for i in period..n {
        let window_start = i + 1 - period;
        let mut positive = 0.0_f64;
        let mut negative = 0.0_f64;
        for j in window_start.max(1)..=i {
            if typical[j] > typical[j - 1] {
                positive += raw_flow[j];
            } else if typical[j] < typical[j - 1] {
                negative += raw_flow[j];
            }
        }

        let mfi = if negative.abs() < f64::EPSILON {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + positive / negative)
        };

        if !mfi.is_finite() {
            break;
        }
        result.push(mfi);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_on_insufficient_data() {
        assert!(calculate_mfi(&[1.0], &[1.0], &[1.0], &[1.0], 14).is_empty());
    }

    #[test]
    fn mismatched_lengths_are_empty() {
        assert!(calculate_mfi(&[1.0, 2.0], &[1.0], &[1.0, 2.0], &[1.0, 2.0], 1).is_empty());
    }

    #[test]
    fn all_positive_flow_clamps_to_one_hundred() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let highs = closes.clone();
        let lows = closes.clone();
        let volumes = vec![100.0; 20];
        let mfi = calculate_mfi(&highs, &lows, &closes, &volumes, 14);
        assert!(!mfi.is_empty());
        for v in &mfi {
            assert!((v - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn all_negative_flow_drives_toward_zero() {
        let closes: Vec<f64> = (1..=20).rev().map(|x| x as f64).collect();
        let highs = closes.clone();
        let lows = closes.clone();
        let volumes = vec![100.0; 20];
        let mfi = calculate_mfi(&highs, &lows, &closes, &volumes, 14);
        assert!(mfi.last().unwrap() < &1.0);
    }
}
