// =============================================================================
// KDJ Stochastic Oscillator
// =============================================================================
//
// KDJ extends the classic stochastic oscillator with a third "J" line that
// overshoots K/D, making reversals easier to spot.
//
// Formula (period `n`, smoothing fixed at the conventional 3/3):
//   RSV_t = (close_t - lowest_low(n)) / (highest_high(n) - lowest_low(n)) * 100
//   K_t   = (2/3) * K_{t-1} + (1/3) * RSV_t      (K_0 seeded at 50)
//   D_t   = (2/3) * D_{t-1} + (1/3) * K_t        (D_0 seeded at 50)
//   J_t   = 3*K_t - 2*D_t
// =============================================================================

/// One point of the KDJ series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kdj {
    pub k: f64,
    pub d: f64,
    pub j: f64,
}

/// Compute the KDJ series over `period`-bar rolling highs/lows. `highs`,
/// `lows`, and `closes` must be the same length and aligned bar-for-bar.
///
/// # Edge cases
/// - `period == 0` or any slice shorter than `period` => empty vec.
/// - Mismatched slice lengths => empty vec.
/// - A flat window (`highest_high == lowest_low`) seeds RSV at 50.0 rather
///   than dividing by zero.
pub fn calculate_kdj(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<Kdj> {
    if period == 0 || highs.len() != lows.len() || highs.len() != closes.len() || closes.len() < period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    let mut prev_k = 50.0_f64;
    let mut prev_d = 50.0_f64;

    for i in (period - 1)..closes.len() {
        let window_start = i + 1 - period;
        let highest_high = highs[window_start..=i].iter().cloned().fold(f64::MIN, f64::max);
        let lowest_low = lows[window_start..=i].iter().cloned().fold(f64::MAX, f64::min);

        let range = highest_high - lowest_low;
        let rsv = if range.abs() < f64::EPSILON {
            50.0
        } else {
            (closes[i] - lowest_low) / range * 100.0
        };

        let k = (2.0 / 3.0) * prev_k + (1.0 / 3.0) * rsv;
        let d = (2.0 / 3.0) * prev_d + (1.0 / 3.0) * k;
        let j = 3.0 * k - 2.0 * d;

        if !k.is_finite() || !d.is_finite() || !j.is_finite() {
            break;
        }

        result.push(Kdj { k, d, j });
        prev_k = k;
        prev_d = d;
    }

    result
}
