// =============================================================================
// Fixed-decimal helpers
// =============================================================================
//
// Design Notes (spec §9): price comparison, diff thresholds, and payload
// normalization must use a decimal type, not binary floating point, to match
// broker expectations. We use `rust_decimal::Decimal` everywhere money or a
// price crosses a module boundary, following the pattern the wider example
// pack (`guribe94-bog`) uses throughout its risk/position types.
// =============================================================================

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Round `value` to `decimals` places using the broker's rounding mode
/// (half-up), the normalization every outbound price/quantity must go
/// through before being placed in an order payload.
pub fn normalize(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// The smallest representable price tick at `decimals` places, e.g.
/// `tick(2) == 0.01`. Used by the order monitor to decide whether a quote
/// has moved enough to justify a `replace_order`.
pub fn tick(decimals: u32) -> Decimal {
    Decimal::new(1, decimals)
}

/// Absolute difference between two decimals, never negative.
pub fn abs_diff(a: Decimal, b: Decimal) -> Decimal {
    (a - b).abs()
}
