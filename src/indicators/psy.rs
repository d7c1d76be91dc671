// =============================================================================
// Psychological Line (PSY)
// =============================================================================
//
// The simplest of the kept/added indicators: the percentage of up-closes in
// a rolling `period`-bar window.
//
//   PSY_t = (count of closes_t > closes_{t-1} over the last `period` deltas)
//           / period * 100
// =============================================================================

/// Compute the PSY series over a rolling `period`-bar window of `closes`.
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` closes => empty vec.
pub fn calculate_psy(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let up_moves: Vec<bool> = closes.windows(2).map(|w| w[1] > w[0]).collect();

    let mut result = Vec::with_capacity(up_moves.len() - period + 1);
    for i in (period - 1)..up_moves.len() {
        let window_start = i + 1 - period;
        let ups = up_moves[window_start..=i].iter().filter(|&&up| up).count();
        result.push(ups as f64 / period as f64 * 100.0);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_on_insufficient_data() {
        assert!(calculate_psy(&[1.0, 2.0], 12).is_empty());
    }

    #[test]
    fn all_up_moves_is_one_hundred() {
        let closes: Vec<f64> = (1..=13).map(|x| x as f64).collect();
        let psy = calculate_psy(&closes, 12);
        assert_eq!(psy, vec![100.0]);
    }

    #[test]
    fn all_down_moves_is_zero() {
        let closes: Vec<f64> = (1..=13).rev().map(|x| x as f64).collect();
        let psy = calculate_psy(&closes, 12);
        assert_eq!(psy, vec![0.0]);
    }

    #[test]
    fn alternating_moves_is_fifty_percent() {
        // 13 closes alternating up/down gives 6 ups across 12 deltas.
        let closes = vec![10.0, 11.0, 10.0, 11.0, 10.0, 11.0, 10.0, 11.0, 10.0, 11.0, 10.0, 11.0, 10.0];
        let psy = calculate_psy(&closes, 12);
        assert_eq!(psy, vec![50.0]);
    }
}
