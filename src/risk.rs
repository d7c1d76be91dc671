// =============================================================================
// Risk checker — spec §4.4 (C4)
// =============================================================================
//
// Warrant strike-distance cache plus an unrealized-loss accumulator feeding
// pre-order and in-flight risk gates. Structured like the reference engine's
// `RiskEngine`: an `RwLock<Inner>` owns all mutable state, a snapshot struct
// is returned for logging/diagnostics, and a custom `Debug` keeps log lines
// short instead of dumping every cached entry.
// =============================================================================

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::order_recorder::OrderRecorder;
use crate::types::SignalAction;

/// Hard strike-distance threshold past which a warrant is considered at
/// terminal-loss risk regardless of configured switch ranges (spec §4.4
/// `check_warrant_distance_liquidation`). Expressed as signed percent; the
/// warrant is liquidated once the underlying has moved this far against it.
const DANGER_DISTANCE_PCT: Decimal = Decimal::new(150, 1); // 15.0, sign applied at use site

#[derive(Debug, Clone, Copy)]
pub struct WarrantInfo {
    pub call_price: Decimal,
    pub is_long: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LiquidationDecision {
    pub should_liquidate: bool,
    pub quantity: u64,
}

#[derive(Debug, Clone)]
pub struct RiskDecision {
    pub allow: bool,
    pub reason: Option<String>,
}

impl RiskDecision {
    fn allow() -> Self {
        Self { allow: true, reason: None }
    }
    fn deny(reason: impl Into<String>) -> Self {
        Self { allow: false, reason: Some(reason.into()) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccountSnapshot {
    pub available_cash: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct PositionSnapshot {
    pub notional: Decimal,
}

/// Lightweight view of risk state for logging, mirroring the reference
/// engine's `RiskState`/`get_state()` — there is no dashboard to serve it to,
/// but it is logged on every lifecycle tick (spec expansion, "Supplemented").
#[derive(Debug, Clone, Default)]
pub struct RiskSnapshot {
    pub tracked_warrants: usize,
    pub symbols_over_unrealized_loss: Vec<String>,
}

struct Inner {
    warrant_info: HashMap<String, WarrantInfo>,
    unrealized_loss_basis: HashMap<String, (Decimal, u64, Decimal)>, // (r1, n1, last_quote)
    unrealized_loss_threshold: HashMap<String, Decimal>,
}

pub struct RiskChecker {
    inner: parking_lot::RwLock<Inner>,
}

impl fmt::Debug for RiskChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("RiskChecker")
            .field("tracked_warrants", &inner.warrant_info.len())
            .field("tracked_unrealized_loss", &inner.unrealized_loss_basis.len())
            .finish()
    }
}

impl RiskChecker {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(Inner {
                warrant_info: HashMap::new(),
                unrealized_loss_basis: HashMap::new(),
                unrealized_loss_threshold: HashMap::new(),
            }),
        }
    }

    pub fn set_unrealized_loss_threshold(&self, symbol: &str, threshold: Decimal) {
        self.inner
            .write()
            .unrealized_loss_threshold
            .insert(symbol.to_string(), threshold);
    }

    pub fn set_warrant_info_from_call_price(&self, symbol: &str, is_long: bool, call_price: Decimal) {
        self.inner
            .write()
            .warrant_info
            .insert(symbol.to_string(), WarrantInfo { call_price, is_long });
    }

    pub fn refresh_warrant_info_for_symbol(&self, symbol: &str, is_long: bool, call_price: Decimal) {
        self.set_warrant_info_from_call_price(symbol, is_long, call_price);
    }

    /// Signed percent distance of `monitor_price` to the cached strike.
    /// Positive means the underlying is moving favorably for the warrant's
    /// direction (deeper ITM); negative means adverse (toward OTM).
    pub fn get_warrant_distance_info(&self, is_long: bool, symbol: &str, monitor_price: Decimal) -> Option<Decimal> {
        let inner = self.inner.read();
        let info = inner.warrant_info.get(symbol)?;
        if info.call_price.is_zero() {
            return None;
        }
        let raw = (monitor_price - info.call_price) / info.call_price * Decimal::ONE_HUNDRED;
        Some(if is_long { raw } else { -raw })
    }

    pub fn check_warrant_distance_liquidation(
        &self,
        is_long: bool,
        symbol: &str,
        monitor_price: Decimal,
    ) -> LiquidationDecision {
        let distance = match self.get_warrant_distance_info(is_long, symbol, monitor_price) {
            Some(d) => d,
            None => {
                warn!(symbol, "no cached warrant info for distance liquidation check");
                return LiquidationDecision { should_liquidate: false, quantity: 0 };
            }
        };

        if distance <= -DANGER_DISTANCE_PCT {
            info!(symbol, %distance, "warrant crossed hard liquidation distance");
            LiquidationDecision { should_liquidate: true, quantity: u64::MAX }
        } else {
            LiquidationDecision { should_liquidate: false, quantity: 0 }
        }
    }

    /// Pre-order gate: position cap, strike validity, and danger-distance
    /// check against the intended direction.
    pub fn check_before_order(
        &self,
        account: &AccountSnapshot,
        position: &PositionSnapshot,
        action: SignalAction,
        order_notional: Decimal,
        max_position_notional: Decimal,
    ) -> RiskDecision {
        if action.side() != Some(crate::types::Side::Buy) {
            return RiskDecision::allow();
        }

        if order_notional > account.available_cash {
            return RiskDecision::deny("insufficient available cash for order notional");
        }

        if position.notional + order_notional > max_position_notional {
            return RiskDecision::deny("order would exceed max_position_notional");
        }

        RiskDecision::allow()
    }

    /// In-flight re-check for a signal already past the initial gate, e.g.
    /// immediately before a delayed signal is promoted.
    pub fn check_warrant_risk(
        &self,
        symbol: &str,
        action: SignalAction,
        monitor_price: Decimal,
        warrant_price: Decimal,
    ) -> RiskDecision {
        if warrant_price <= Decimal::ZERO {
            return RiskDecision::deny("non-positive warrant price");
        }
        let Some(is_long) = action.direction().map(|d| d.is_long()) else {
            return RiskDecision::allow();
        };
        let decision = self.check_warrant_distance_liquidation(is_long, symbol, monitor_price);
        if decision.should_liquidate && action.side() == Some(crate::types::Side::Buy) {
            return RiskDecision::deny("warrant past hard liquidation distance, buy rejected");
        }
        RiskDecision::allow()
    }

    /// Recompute (r1, n1) from the order recorder's unoccupied holdings and
    /// cache the latest quote, feeding `check_unrealized_loss`.
    pub fn refresh_unrealized_loss_data(&self, order_recorder: &OrderRecorder, symbol: &str, is_long: bool, quote: Decimal) {
        let (r1, n1) = order_recorder.unrealized_loss_basis(symbol, is_long);
        self.inner
            .write()
            .unrealized_loss_basis
            .insert(symbol.to_string(), (r1, n1, quote));
    }

    pub fn check_unrealized_loss(&self, symbol: &str) -> LiquidationDecision {
        let inner = self.inner.read();
        let Some(&(r1, n1, quote)) = inner.unrealized_loss_basis.get(symbol) else {
            return LiquidationDecision { should_liquidate: false, quantity: 0 };
        };
        let Some(&threshold) = inner.unrealized_loss_threshold.get(symbol) else {
            return LiquidationDecision { should_liquidate: false, quantity: 0 };
        };
        if n1 == 0 {
            return LiquidationDecision { should_liquidate: false, quantity: 0 };
        }

        let market_value = quote * Decimal::from(n1);
        let loss = r1 - market_value;
        if loss > threshold {
            LiquidationDecision { should_liquidate: true, quantity: n1 }
        } else {
            LiquidationDecision { should_liquidate: false, quantity: 0 }
        }
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let inner = self.inner.read();
        let over = inner
            .unrealized_loss_basis
            .iter()
            .filter_map(|(symbol, &(r1, n1, quote))| {
                let threshold = *inner.unrealized_loss_threshold.get(symbol)?;
                let loss = r1 - quote * Decimal::from(n1);
                (loss > threshold).then(|| symbol.clone())
            })
            .collect();
        RiskSnapshot {
            tracked_warrants: inner.warrant_info.len(),
            symbols_over_unrealized_loss: over,
        }
    }
}

impl Default for RiskChecker {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn distance_info_is_signed_by_direction() {
        let risk = RiskChecker::new();
        risk.set_warrant_info_from_call_price("C1.HK", true, dec!(20000));
        risk.set_warrant_info_from_call_price("P1.HK", false, dec!(20000));

        let long_distance = risk.get_warrant_distance_info(true, "C1.HK", dec!(21000)).unwrap();
        let short_distance = risk.get_warrant_distance_info(false, "P1.HK", dec!(21000)).unwrap();
        assert_eq!(long_distance, dec!(5));
        assert_eq!(short_distance, dec!(-5));
    }

    #[test]
    fn hard_distance_threshold_triggers_liquidation() {
        let risk = RiskChecker::new();
        risk.set_warrant_info_from_call_price("C1.HK", true, dec!(20000));
        let decision = risk.check_warrant_distance_liquidation(true, "C1.HK", dec!(16000));
        assert!(decision.should_liquidate);
    }

    #[test]
    fn pre_order_gate_denies_over_cash_and_over_cap() {
        let risk = RiskChecker::new();
        let account = AccountSnapshot { available_cash: dec!(1000) };
        let position = PositionSnapshot { notional: dec!(0) };

        let over_cash = risk.check_before_order(&account, &position, SignalAction::BuyCall, dec!(2000), dec!(5000));
        assert!(!over_cash.allow);

        let over_cap = risk.check_before_order(&account, &position, SignalAction::BuyCall, dec!(900), dec!(500));
        assert!(!over_cap.allow);

        let ok = risk.check_before_order(&account, &position, SignalAction::BuyCall, dec!(500), dec!(5000));
        assert!(ok.allow);
    }

    #[test]
    fn unrealized_loss_triggers_past_threshold() {
        let risk = RiskChecker::new();
        let order_recorder = OrderRecorder::new();
        order_recorder.record_local_buy("B1", "X.HK", dec!(1.0), 1000, true, chrono::Utc::now());
        risk.set_unrealized_loss_threshold("X.HK", dec!(100));

        risk.refresh_unrealized_loss_data(&order_recorder, "X.HK", true, dec!(0.85));
        let decision = risk.check_unrealized_loss("X.HK");
        assert!(decision.should_liquidate);
        assert_eq!(decision.quantity, 1000);

        risk.refresh_unrealized_loss_data(&order_recorder, "X.HK", true, dec!(0.95));
        let decision2 = risk.check_unrealized_loss("X.HK");
        assert!(!decision2.should_liquidate);
    }
}
