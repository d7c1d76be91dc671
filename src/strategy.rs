// =============================================================================
// Strategy & signal processor — spec §4.8 (C8)
// =============================================================================
//
// `StrategyEngine::evaluate` turns one monitor's indicator snapshot into
// immediate and delayed signals by evaluating `signal_config`'s per-action
// condition groups (spec §6). `SignalProcessor` then resolves sell
// quantities against the order recorder and applies the risk gate, dropping
// signals that fail either step. Grounded on the reference engine's
// `StrategyEngine::evaluate_symbol` (pure function of shared state producing
// a decision + optional trade proposal) but reshaped around condition
// groups instead of the reference engine's bespoke regime/absorption scoring,
// since spec §6 names `condition_groups` as the configuration surface.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::{evaluate_condition_groups, MonitorConfig};
use crate::indicators::IndicatorSnapshot;
use crate::order_recorder::{OrderRecorder, SelectSellableOrdersArgs};
use crate::risk::{AccountSnapshot, PositionSnapshot, RiskChecker};
use crate::calendar::TradingCalendar;
use crate::types::{Direction, Signal, SignalAction};

/// Per-monitor prices the strategy needs beyond the raw indicator snapshot
/// (spec §3 Monitor state: `monitor_price`, `long_price`, `short_price`).
#[derive(Debug, Clone, Copy)]
pub struct MonitorPrices {
    pub monitor_price: Decimal,
    pub long_price: Option<Decimal>,
    pub short_price: Option<Decimal>,
}

/// Output of one strategy evaluation: signals ready for immediate
/// enqueueing, plus signals that must wait out a verification delay.
pub struct StrategyOutput {
    pub immediate_signals: Vec<Signal>,
    /// (signal, direction, delay_seconds) — the caller hands these to the
    /// `DelayedSignalVerifier` along with the matching verification groups.
    pub delayed_signals: Vec<(Signal, Direction, u64)>,
}

pub struct StrategyEngine;

impl StrategyEngine {
    /// Evaluate `config.signal_config`'s condition groups against
    /// `snapshot`, producing BUYCALL/SELLCALL/BUYPUT/SELLPUT signals for
    /// whichever actions trigger. An action configured under
    /// `verification_config` is deferred (delayed); everything else is
    /// immediate.
    pub fn evaluate(
        config: &MonitorConfig,
        prices: MonitorPrices,
        snapshot: &IndicatorSnapshot,
        seat_version_long: u64,
        seat_version_short: u64,
        now: DateTime<Utc>,
    ) -> StrategyOutput {
        let mut immediate = Vec::new();
        let mut delayed = Vec::new();

        let actions: [(SignalAction, &[crate::config::ConditionGroup]); 4] = [
            (SignalAction::BuyCall, &config.signal_config.buycall),
            (SignalAction::SellCall, &config.signal_config.sellcall),
            (SignalAction::BuyPut, &config.signal_config.buyput),
            (SignalAction::SellPut, &config.signal_config.sellput),
        ];

        for (action, groups) in actions {
            if !evaluate_condition_groups(groups, snapshot) {
                continue;
            }

            let direction = action.direction().expect("non-HOLD action always has a direction");
            let price = match direction {
                Direction::Long => prices.long_price,
                Direction::Short => prices.short_price,
            };
            let Some(price) = price else {
                debug!(?action, "no live seat price, dropping signal");
                continue;
            };

            let seat_version = match direction {
                Direction::Long => seat_version_long,
                Direction::Short => seat_version_short,
            };

            let signal = Signal {
                symbol: String::new(), // resolved by the caller once the bound seat symbol is known
                action,
                reason: format!("condition_groups matched for {action}"),
                price,
                lot_size: 0, // resolved by the executor from the warrant listing
                quantity: None,
                trigger_time: now,
                seat_version,
                order_type_override: None,
                is_protective_liquidation: false,
                indicators_snapshot: snapshot.clone(),
                verification_history: Vec::new(),
                related_buy_order_ids: Vec::new(),
            };

            let verification = match action.side() {
                Some(crate::types::Side::Buy) => Some(&config.verification_config.buy),
                Some(crate::types::Side::Sell) => Some(&config.verification_config.sell),
                None => None,
            };

            match verification {
                Some(v) if !v.indicators.is_empty() => {
                    delayed.push((signal, direction, v.delay_seconds));
                }
                _ => immediate.push(signal),
            }
        }

        StrategyOutput { immediate_signals: immediate, delayed_signals: delayed }
    }
}

/// Arguments for `SignalProcessor::process_sell_signals`.
pub struct ProcessSellArgs<'a> {
    pub order_recorder: &'a OrderRecorder,
    pub trading_calendar: &'a dyn TradingCalendar,
    pub smart_close_enabled: bool,
    pub smart_close_timeout_minutes: Option<u32>,
    pub now: DateTime<Utc>,
}

pub struct SignalProcessor;

impl SignalProcessor {
    /// Resolve a sell quantity for each sell signal via
    /// `select_sellable_orders`, capped by current available position.
    /// Signals that would sell zero quantity are dropped (spec §4.8).
    pub fn process_sell_signals(signals: Vec<Signal>, symbol: &str, is_long: bool, args: ProcessSellArgs<'_>) -> Vec<Signal> {
        signals
            .into_iter()
            .filter_map(|mut signal| {
                if signal.action.side() != Some(crate::types::Side::Sell) {
                    return Some(signal);
                }

                let available = args.order_recorder.available_quantity(symbol, is_long);
                if available == 0 {
                    debug!(symbol, "dropping sell signal: no available position");
                    return None;
                }

                let selection = args.order_recorder.select_sellable_orders(SelectSellableOrdersArgs {
                    symbol,
                    is_long,
                    current_price: signal.price,
                    max_sell_quantity: available,
                    smart_close_enabled: args.smart_close_enabled,
                    smart_close_timeout_minutes: args.smart_close_timeout_minutes,
                    now: args.now,
                    trading_calendar: args.trading_calendar,
                });

                if selection.quantity == 0 {
                    debug!(symbol, "dropping sell signal: smart-close selected zero quantity");
                    return None;
                }

                signal.symbol = symbol.to_string();
                signal.quantity = Some(selection.quantity);
                signal.related_buy_order_ids = selection.related_buy_order_ids;
                Some(signal)
            })
            .collect()
    }

    /// Run the pre-order risk gate over every signal, dropping (with a
    /// logged reason) any that is denied.
    pub fn apply_risk_checks(
        signals: Vec<Signal>,
        risk: &RiskChecker,
        account: &AccountSnapshot,
        position: &PositionSnapshot,
        order_notional: Decimal,
        max_position_notional: Decimal,
    ) -> Vec<Signal> {
        signals
            .into_iter()
            .filter(|signal| {
                let decision = risk.check_before_order(account, position, signal.action, order_notional, max_position_notional);
                if !decision.allow {
                    info!(symbol = %signal.symbol, action = %signal.action, reason = ?decision.reason, "signal dropped by risk gate");
                }
                decision.allow
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::SimpleHkCalendar;
    use crate::config::{CompareOp, Condition, MonitorConfig, SignalConfig, VerificationConfig, VerificationSide};
    use crate::types::LiquidationCooldown;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn base_config() -> MonitorConfig {
        MonitorConfig {
            monitor_symbol: "HSI".into(),
            long_symbol: None,
            short_symbol: None,
            target_notional: dec!(50000),
            max_position_notional: dec!(200000),
            max_daily_loss: dec!(10000),
            max_unrealized_loss_per_symbol: dec!(5000),
            buy_interval_seconds: 60,
            liquidation_cooldown: LiquidationCooldown::Minutes(30),
            smart_close_enabled: true,
            smart_close_timeout_minutes: Some(60),
            auto_search_config: Default::default(),
            verification_config: VerificationConfig::default(),
            signal_config: SignalConfig::default(),
            order_ownership_mapping: HashMap::new(),
        }
    }

    #[test]
    fn immediate_signal_emitted_when_no_verification_indicators_configured() {
        let mut config = base_config();
        config.signal_config.buycall = vec![vec![Condition { indicator: "rsi".into(), op: CompareOp::Lt, value: 30.0 }]];

        let mut snapshot = IndicatorSnapshot::new();
        snapshot.insert("rsi".into(), 20.0);

        let prices = MonitorPrices { monitor_price: dec!(20000), long_price: Some(dec!(1.0)), short_price: None };
        let out = StrategyEngine::evaluate(&config, prices, &snapshot, 5, 0, Utc::now());

        assert_eq!(out.immediate_signals.len(), 1);
        assert_eq!(out.immediate_signals[0].action, SignalAction::BuyCall);
        assert_eq!(out.immediate_signals[0].seat_version, 5);
        assert!(out.delayed_signals.is_empty());
    }

    #[test]
    fn delayed_signal_emitted_when_verification_indicators_configured() {
        let mut config = base_config();
        config.signal_config.sellcall = vec![vec![Condition { indicator: "rsi".into(), op: CompareOp::Gt, value: 70.0 }]];
        config.verification_config.sell = VerificationSide {
            delay_seconds: 45,
            indicators: vec![vec![Condition { indicator: "rsi".into(), op: CompareOp::Gt, value: 65.0 }]],
        };

        let mut snapshot = IndicatorSnapshot::new();
        snapshot.insert("rsi".into(), 75.0);

        let prices = MonitorPrices { monitor_price: dec!(20000), long_price: Some(dec!(1.0)), short_price: None };
        let out = StrategyEngine::evaluate(&config, prices, &snapshot, 1, 0, Utc::now());

        assert!(out.immediate_signals.is_empty());
        assert_eq!(out.delayed_signals.len(), 1);
        assert_eq!(out.delayed_signals[0].1, Direction::Long);
        assert_eq!(out.delayed_signals[0].2, 45);
    }

    #[test]
    fn missing_seat_price_drops_signal() {
        let mut config = base_config();
        config.signal_config.buyput = vec![vec![Condition { indicator: "rsi".into(), op: CompareOp::Lt, value: 30.0 }]];
        let mut snapshot = IndicatorSnapshot::new();
        snapshot.insert("rsi".into(), 10.0);

        let prices = MonitorPrices { monitor_price: dec!(20000), long_price: Some(dec!(1.0)), short_price: None };
        let out = StrategyEngine::evaluate(&config, prices, &snapshot, 0, 0, Utc::now());
        assert!(out.immediate_signals.is_empty());
    }

    #[test]
    fn process_sell_signals_drops_zero_quantity() {
        let recorder = OrderRecorder::new();
        let calendar = SimpleHkCalendar::new();
        let signal = Signal {
            symbol: String::new(),
            action: SignalAction::SellCall,
            reason: "t".into(),
            price: dec!(1.0),
            lot_size: 100,
            quantity: None,
            trigger_time: Utc::now(),
            seat_version: 0,
            order_type_override: None,
            is_protective_liquidation: false,
            indicators_snapshot: IndicatorSnapshot::new(),
            verification_history: Vec::new(),
            related_buy_order_ids: Vec::new(),
        };

        let result = SignalProcessor::process_sell_signals(
            vec![signal],
            "X.HK",
            true,
            ProcessSellArgs {
                order_recorder: &recorder,
                trading_calendar: &calendar,
                smart_close_enabled: true,
                smart_close_timeout_minutes: None,
                now: Utc::now(),
            },
        );
        assert!(result.is_empty(), "no held position means the sell should be dropped");
    }

    #[test]
    fn process_sell_signals_resolves_quantity_from_ledger() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy("B1", "X.HK", dec!(1.0), 100, true, Utc::now() - chrono::Duration::minutes(5));
        let calendar = SimpleHkCalendar::new();

        let signal = Signal {
            symbol: String::new(),
            action: SignalAction::SellCall,
            reason: "t".into(),
            price: dec!(1.2),
            lot_size: 100,
            quantity: None,
            trigger_time: Utc::now(),
            seat_version: 0,
            order_type_override: None,
            is_protective_liquidation: false,
            indicators_snapshot: IndicatorSnapshot::new(),
            verification_history: Vec::new(),
            related_buy_order_ids: Vec::new(),
        };

        let result = SignalProcessor::process_sell_signals(
            vec![signal],
            "X.HK",
            true,
            ProcessSellArgs {
                order_recorder: &recorder,
                trading_calendar: &calendar,
                smart_close_enabled: true,
                smart_close_timeout_minutes: None,
                now: Utc::now(),
            },
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].quantity, Some(100));
        assert_eq!(result[0].related_buy_order_ids, vec!["B1".to_string()]);
    }

    #[test]
    fn apply_risk_checks_drops_denied_signals() {
        let risk = RiskChecker::new();
        let account = AccountSnapshot { available_cash: dec!(100) };
        let position = PositionSnapshot { notional: dec!(0) };

        let signal = Signal {
            symbol: "X.HK".into(),
            action: SignalAction::BuyCall,
            reason: "t".into(),
            price: dec!(1.0),
            lot_size: 100,
            quantity: Some(1000),
            trigger_time: Utc::now(),
            seat_version: 0,
            order_type_override: None,
            is_protective_liquidation: false,
            indicators_snapshot: IndicatorSnapshot::new(),
            verification_history: Vec::new(),
            related_buy_order_ids: Vec::new(),
        };

        let result = SignalProcessor::apply_risk_checks(vec![signal], &risk, &account, &position, dec!(1000), dec!(5000));
        assert!(result.is_empty());
    }
}
