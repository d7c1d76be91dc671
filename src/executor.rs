// =============================================================================
// Order executor — spec §4.6 (C6)
// =============================================================================
//
// Resolves final order quantity, builds the broker payload, and submits
// through the rate limiter, then hands the new `TrackedOrder` off via the
// `OrderTracker` capability (implemented by the order monitor) rather than
// depending on it directly — the same "capability handle, not a
// bidirectional strong ref" shape spec §9 calls for between the strategy
// and order-monitor layers. Grounded on the reference engine's
// `ExecutionEngine::execute_proposal` (risk gate re-check immediately before
// every broker call, Placed/Blocked/Error outcome enum) generalized from a
// single demo/live branch to the buy/sell/cancel/replace surface spec §4.6
// names.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::broker::{OrderPayload, ReplacePayload, TradeContext};
use crate::errors::EngineError;
use crate::order_recorder::OrderRecorder;
use crate::rate_limiter::RateLimiter;
use crate::types::{Direction, OrderStatus, OrderType, Side, Signal, SignalAction, TrackedOrder};

/// Per-symbol metadata the executor needs to resolve a buy quantity.
/// Populated by the caller from the bound seat's cached `WarrantListing`.
#[derive(Debug, Clone, Copy)]
pub struct SymbolMeta {
    pub lot_size: u64,
}

/// Toggle consulted at every submit point in addition to
/// `is_trading_enabled`, spec §4.6: "an external `is_execution_allowed()`
/// callback (may toggle mid-tick)".
pub trait ExecutionGate: Send + Sync {
    fn is_execution_allowed(&self) -> bool;
}

/// Always-allow gate, used where no external toggle is wired up (tests, or
/// a deployment with no manual kill switch).
pub struct AlwaysAllow;

impl ExecutionGate for AlwaysAllow {
    fn is_execution_allowed(&self) -> bool {
        true
    }
}

/// Registers a newly submitted order for lifecycle tracking. Implemented by
/// the order monitor; kept as a narrow trait here so this module has no
/// compile-time dependency on it.
pub trait OrderTracker: Send + Sync {
    fn track_order(&self, order: TrackedOrder);
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Submitted(TrackedOrder),
    /// Dropped before any broker call: zero resolved quantity, execution
    /// gate closed, or a validation failure.
    Skipped { symbol: String, reason: String },
    /// Broker rejected the submit; caller treats this as
    /// `EngineError::TransientBroker` for retry/log purposes.
    Failed { symbol: String, error: String },
}

pub struct ExecuteArgs<'a> {
    pub signals: Vec<Signal>,
    pub symbol_meta: &'a HashMap<String, SymbolMeta>,
    pub target_notional: Decimal,
    pub trading_order_type: OrderType,
    pub liquidation_order_type: OrderType,
    pub is_trading_enabled: bool,
    pub execution_gate: &'a dyn ExecutionGate,
    pub now: DateTime<Utc>,
}

pub struct OrderExecutor {
    trade: Arc<dyn TradeContext>,
    rate_limiter: Arc<RateLimiter>,
    order_recorder: Arc<OrderRecorder>,
    order_tracker: Arc<dyn OrderTracker>,
}

impl OrderExecutor {
    pub fn new(
        trade: Arc<dyn TradeContext>,
        rate_limiter: Arc<RateLimiter>,
        order_recorder: Arc<OrderRecorder>,
        order_tracker: Arc<dyn OrderTracker>,
    ) -> Self {
        Self { trade, rate_limiter, order_recorder, order_tracker }
    }

    /// Execute every signal in order, each through its own rate-limited
    /// execution-gate re-check (spec §4.6: the gate "may toggle mid-tick",
    /// so it is read fresh per signal, not once for the whole batch).
    pub async fn execute_signals(&self, args: ExecuteArgs<'_>) -> Vec<ExecutionOutcome> {
        let mut outcomes = Vec::with_capacity(args.signals.len());
        for signal in args.signals {
            let outcome = self.execute_one(signal, &args).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn execute_one(&self, signal: Signal, args: &ExecuteArgs<'_>) -> ExecutionOutcome {
        if !args.is_trading_enabled || !args.execution_gate.is_execution_allowed() {
            return ExecutionOutcome::Skipped {
                symbol: signal.symbol.clone(),
                reason: "execution gate closed".to_string(),
            };
        }

        let Some(side) = signal.action.side() else {
            return ExecutionOutcome::Skipped { symbol: signal.symbol.clone(), reason: "HOLD action".to_string() };
        };

        let quantity = match side {
            Side::Buy => {
                let lot_size = args.symbol_meta.get(&signal.symbol).map(|m| m.lot_size).unwrap_or(0);
                resolve_buy_quantity(&signal, args.target_notional, lot_size)
            }
            Side::Sell => signal.quantity.unwrap_or(0),
        };

        if quantity == 0 {
            return ExecutionOutcome::Skipped {
                symbol: signal.symbol.clone(),
                reason: "resolved quantity is zero".to_string(),
            };
        }

        let order_type = signal
            .order_type_override
            .unwrap_or(if signal.is_protective_liquidation { args.liquidation_order_type } else { args.trading_order_type });

        let price = match order_type {
            OrderType::Mo => None,
            OrderType::Lo | OrderType::Elo => Some(signal.price),
        };

        let payload = OrderPayload { symbol: signal.symbol.clone(), side, order_type, price, quantity };

        self.rate_limiter.throttle().await;
        let submitted = match self.trade.submit_order(payload).await {
            Ok(submitted) => submitted,
            Err(e) => {
                warn!(symbol = %signal.symbol, %side, error = %e, "order submit failed");
                return ExecutionOutcome::Failed { symbol: signal.symbol.clone(), error: e.to_string() };
            }
        };

        if side == Side::Sell {
            let direction = signal.monitor_direction().unwrap_or(Direction::Long);
            self.order_recorder.submit_sell_order(
                &submitted.order_id,
                &signal.symbol,
                direction,
                quantity,
                signal.related_buy_order_ids.clone(),
                args.now,
            );
        }

        info!(
            symbol = %signal.symbol,
            %side,
            %order_type,
            order_id = %submitted.order_id,
            quantity,
            "order submitted"
        );

        let tracked = TrackedOrder {
            order_id: submitted.order_id,
            symbol: signal.symbol.clone(),
            side,
            is_long_symbol: signal.monitor_direction().map(Direction::is_long).unwrap_or(true),
            monitor_symbol: signal.symbol.clone(),
            is_protective_liquidation: signal.is_protective_liquidation,
            order_type,
            submitted_price: price,
            submitted_quantity: quantity,
            executed_quantity: 0,
            status: OrderStatus::New,
            submitted_at: args.now,
            last_price_update_at: args.now,
            converted_to_market: false,
        };
        self.order_tracker.track_order(tracked.clone());

        ExecutionOutcome::Submitted(tracked)
    }

    /// Rate-limited cancel. Ledger/cache invalidation on confirmation is the
    /// order monitor's responsibility once it observes the terminal status.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError> {
        self.rate_limiter.throttle().await;
        self.trade
            .cancel_order(order_id)
            .await
            .map_err(|e| EngineError::TransientBroker(e.to_string()))
    }

    /// Rate-limited price/quantity replace (price-chase step).
    pub async fn replace_order_price(&self, order_id: &str, new_price: Decimal, new_quantity: u64) -> Result<(), EngineError> {
        self.rate_limiter.throttle().await;
        self.trade
            .replace_order(ReplacePayload { order_id: order_id.to_string(), price: new_price, quantity: new_quantity })
            .await
            .map_err(|e| EngineError::TransientBroker(e.to_string()))
    }
}

/// `floor(target_notional / price / lot_size) * lot_size`, spec §4.6
/// "notional/lot_size" quantity resolution. A signal that already carries an
/// explicit `quantity` (the signal processor sets this for sells; strategy
/// may also pin it for scripted tests) is honored as-is.
fn resolve_buy_quantity(signal: &Signal, target_notional: Decimal, lot_size: u64) -> u64 {
    if let Some(q) = signal.quantity {
        return q;
    }
    if lot_size == 0 || signal.price <= Decimal::ZERO {
        return 0;
    }
    let lots = (target_notional / signal.price / Decimal::from(lot_size)).floor();
    let lots = lots.to_u64().unwrap_or(0);
    lots * lot_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::indicators::IndicatorSnapshot;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    fn sample_signal(action: SignalAction, symbol: &str, price: Decimal, quantity: Option<u64>) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            action,
            reason: "test".into(),
            price,
            lot_size: 100,
            quantity,
            trigger_time: Utc::now(),
            seat_version: 1,
            order_type_override: None,
            is_protective_liquidation: false,
            indicators_snapshot: IndicatorSnapshot::new(),
            verification_history: Vec::new(),
            related_buy_order_ids: Vec::new(),
        }
    }

    struct RecordingTracker {
        tracked: StdMutex<Vec<TrackedOrder>>,
    }

    impl RecordingTracker {
        fn new() -> Arc<Self> {
            Arc::new(Self { tracked: StdMutex::new(Vec::new()) })
        }
    }

    impl OrderTracker for RecordingTracker {
        fn track_order(&self, order: TrackedOrder) {
            self.tracked.lock().unwrap().push(order);
        }
    }

    fn executor(tracker: Arc<RecordingTracker>) -> (OrderExecutor, Arc<MockBroker>) {
        let broker = Arc::new(MockBroker::new());
        let executor = OrderExecutor::new(
            broker.clone(),
            Arc::new(RateLimiter::new(100, 1000)),
            Arc::new(OrderRecorder::new()),
            tracker,
        );
        (executor, broker)
    }

    #[test]
    fn resolve_buy_quantity_floors_to_lot_size() {
        let signal = sample_signal(SignalAction::BuyCall, "X.HK", dec!(1.23), None);
        let qty = resolve_buy_quantity(&signal, dec!(10000), 100);
        // 10000 / 1.23 = 8130.08...; floor to lots of 100 -> 8100
        assert_eq!(qty, 8100);
    }

    #[test]
    fn resolve_buy_quantity_zero_lot_size_yields_zero() {
        let signal = sample_signal(SignalAction::BuyCall, "X.HK", dec!(1.0), None);
        assert_eq!(resolve_buy_quantity(&signal, dec!(10000), 0), 0);
    }

    #[tokio::test]
    async fn submits_buy_and_tracks_order() {
        let tracker = RecordingTracker::new();
        let (executor, _broker) = executor(tracker.clone());
        let mut meta = HashMap::new();
        meta.insert("X.HK".to_string(), SymbolMeta { lot_size: 100 });

        let signal = sample_signal(SignalAction::BuyCall, "X.HK", dec!(1.0), None);
        let outcomes = executor
            .execute_signals(ExecuteArgs {
                signals: vec![signal],
                symbol_meta: &meta,
                target_notional: dec!(1000),
                trading_order_type: OrderType::Elo,
                liquidation_order_type: OrderType::Mo,
                is_trading_enabled: true,
                execution_gate: &AlwaysAllow,
                now: Utc::now(),
            })
            .await;

        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            ExecutionOutcome::Submitted(order) => {
                assert_eq!(order.submitted_quantity, 1000);
                assert_eq!(order.order_type, OrderType::Elo);
            }
            other => panic!("expected Submitted, got {other:?}"),
        }
        assert_eq!(tracker.tracked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn execution_gate_closed_skips_without_broker_call() {
        struct NeverAllow;
        impl ExecutionGate for NeverAllow {
            fn is_execution_allowed(&self) -> bool {
                false
            }
        }

        let tracker = RecordingTracker::new();
        let (executor, _broker) = executor(tracker.clone());
        let meta = HashMap::new();
        let signal = sample_signal(SignalAction::BuyCall, "X.HK", dec!(1.0), None);

        let outcomes = executor
            .execute_signals(ExecuteArgs {
                signals: vec![signal],
                symbol_meta: &meta,
                target_notional: dec!(1000),
                trading_order_type: OrderType::Elo,
                liquidation_order_type: OrderType::Mo,
                is_trading_enabled: true,
                execution_gate: &NeverAllow,
                now: Utc::now(),
            })
            .await;

        assert!(matches!(outcomes[0], ExecutionOutcome::Skipped { .. }));
        assert!(tracker.tracked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn liquidation_override_forces_market_order() {
        let tracker = RecordingTracker::new();
        let (executor, _broker) = executor(tracker.clone());
        let mut meta = HashMap::new();
        meta.insert("X.HK".to_string(), SymbolMeta { lot_size: 100 });

        let mut signal = sample_signal(SignalAction::SellCall, "X.HK", dec!(1.0), Some(100));
        signal.is_protective_liquidation = true;

        let outcomes = executor
            .execute_signals(ExecuteArgs {
                signals: vec![signal],
                symbol_meta: &meta,
                target_notional: dec!(1000),
                trading_order_type: OrderType::Elo,
                liquidation_order_type: OrderType::Mo,
                is_trading_enabled: true,
                execution_gate: &AlwaysAllow,
                now: Utc::now(),
            })
            .await;

        match &outcomes[0] {
            ExecutionOutcome::Submitted(order) => {
                assert_eq!(order.order_type, OrderType::Mo);
                assert!(order.submitted_price.is_none());
            }
            other => panic!("expected Submitted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_quantity_sell_is_skipped() {
        let tracker = RecordingTracker::new();
        let (executor, _broker) = executor(tracker.clone());
        let meta = HashMap::new();
        let signal = sample_signal(SignalAction::SellCall, "X.HK", dec!(1.0), Some(0));

        let outcomes = executor
            .execute_signals(ExecuteArgs {
                signals: vec![signal],
                symbol_meta: &meta,
                target_notional: dec!(1000),
                trading_order_type: OrderType::Elo,
                liquidation_order_type: OrderType::Mo,
                is_trading_enabled: true,
                execution_gate: &AlwaysAllow,
                now: Utc::now(),
            })
            .await;

        assert!(matches!(outcomes[0], ExecutionOutcome::Skipped { .. }));
    }
}
