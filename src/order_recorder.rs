// =============================================================================
// Order recorder — spec §4.3 (C3)
// =============================================================================
//
// FIFO buy ledger plus pending-sell occupancy accounting, one ledger per
// (symbol, is_long). Built on the reference engine's `PositionManager`
// idiom — a manager owning `RwLock<Vec<T>>` state mutated in place — but the
// semantics are entirely different: this is accounting, not exit-rule
// evaluation.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::calendar::TradingCalendar;
use crate::types::Direction;

#[derive(Debug, Clone)]
pub struct BuyRecord {
    pub order_id: String,
    pub symbol: String,
    pub executed_price: Decimal,
    pub executed_quantity: u64,
    pub executed_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PendingSell {
    pub order_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub submitted_quantity: u64,
    pub related_buy_order_ids: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub executed_quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    symbol: String,
    is_long: bool,
}

struct Ledger {
    /// Filled buys still (partially) available, ordered by executed_time.
    buys: Vec<BuyRecord>,
    /// Live pending sells against this ledger, keyed by order_id.
    pending_sells: HashMap<String, PendingSell>,
}

impl Ledger {
    fn new() -> Self {
        Self {
            buys: Vec::new(),
            pending_sells: HashMap::new(),
        }
    }

    fn occupied_buy_ids(&self) -> std::collections::HashSet<&str> {
        self.pending_sells
            .values()
            .flat_map(|ps| ps.related_buy_order_ids.iter().map(String::as_str))
            .collect()
    }
}

/// Outcome of `select_sellable_orders`.
#[derive(Debug, Clone, Default)]
pub struct SellSelection {
    pub related_buy_order_ids: Vec<String>,
    pub quantity: u64,
}

pub struct SelectSellableOrdersArgs<'a> {
    pub symbol: &'a str,
    pub is_long: bool,
    pub current_price: Decimal,
    pub max_sell_quantity: u64,
    pub smart_close_enabled: bool,
    pub smart_close_timeout_minutes: Option<u32>,
    pub now: DateTime<Utc>,
    pub trading_calendar: &'a dyn TradingCalendar,
}

/// Per (symbol, is_long) FIFO buy ledger with pending-sell occupancy, spec
/// §4.3.
pub struct OrderRecorder {
    ledgers: RwLock<HashMap<LedgerKey, Ledger>>,
}

impl OrderRecorder {
    pub fn new() -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    fn key(symbol: &str, is_long: bool) -> LedgerKey {
        LedgerKey {
            symbol: symbol.to_string(),
            is_long,
        }
    }

    /// Append a filled buy. No dedup by order_id — duplicate fills for the
    /// same order_id would be a broker-level bug upstream of this layer.
    pub fn record_local_buy(
        &self,
        order_id: &str,
        symbol: &str,
        price: Decimal,
        quantity: u64,
        is_long: bool,
        executed_time: DateTime<Utc>,
    ) {
        let mut ledgers = self.ledgers.write();
        let ledger = ledgers.entry(Self::key(symbol, is_long)).or_insert_with(Ledger::new);
        ledger.buys.push(BuyRecord {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            executed_price: price,
            executed_quantity: quantity,
            executed_time,
        });
        ledger.buys.sort_by_key(|b| b.executed_time);
        debug!(symbol, is_long, quantity, "recorded local buy");
    }

    /// Close out a fill against its owning pending sell if `order_id` names
    /// one; otherwise deduct FIFO-oldest buys until `quantity` is satisfied
    /// (used for sells with no pending-sell owner, e.g. replayed liquidations).
    pub fn record_local_sell(
        &self,
        symbol: &str,
        quantity: u64,
        is_long: bool,
        order_id: Option<&str>,
    ) {
        let mut ledgers = self.ledgers.write();
        let Some(ledger) = ledgers.get_mut(&Self::key(symbol, is_long)) else {
            warn!(symbol, is_long, "record_local_sell against unknown ledger");
            return;
        };

        let owned_ids: Option<Vec<String>> = order_id
            .and_then(|id| ledger.pending_sells.get(id))
            .map(|ps| ps.related_buy_order_ids.clone());

        let ids_to_deduct: Vec<String> = match owned_ids {
            Some(ids) => ids,
            None => {
                // No owner: deduct FIFO oldest buys until quantity satisfied.
                let mut remaining = quantity;
                let mut ids = Vec::new();
                for buy in ledger.buys.iter() {
                    if remaining == 0 {
                        break;
                    }
                    ids.push(buy.order_id.clone());
                    remaining = remaining.saturating_sub(buy.executed_quantity);
                }
                ids
            }
        };

        remove_quantity(&mut ledger.buys, &ids_to_deduct, quantity);
    }

    /// Register pending-sell occupancy ahead of submitting a sell order.
    pub fn submit_sell_order(
        &self,
        order_id: &str,
        symbol: &str,
        direction: Direction,
        quantity: u64,
        related_buy_order_ids: Vec<String>,
        submitted_at: DateTime<Utc>,
    ) {
        let mut ledgers = self.ledgers.write();
        let ledger = ledgers
            .entry(Self::key(symbol, direction.is_long()))
            .or_insert_with(Ledger::new);
        ledger.pending_sells.insert(
            order_id.to_string(),
            PendingSell {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
                direction,
                submitted_quantity: quantity,
                related_buy_order_ids,
                submitted_at,
                executed_quantity: 0,
            },
        );
    }

    pub fn mark_sell_partial_filled(&self, symbol: &str, is_long: bool, order_id: &str, executed_quantity: u64) {
        let mut ledgers = self.ledgers.write();
        if let Some(ledger) = ledgers.get_mut(&Self::key(symbol, is_long)) {
            if let Some(ps) = ledger.pending_sells.get_mut(order_id) {
                ps.executed_quantity = executed_quantity;
            }
        }
    }

    /// Cancel a pending sell, releasing its occupied buy ids back to the
    /// pool and returning them so the caller can reuse them (e.g. for a
    /// timeout-driven market reissue).
    pub fn mark_sell_cancelled(&self, symbol: &str, is_long: bool, order_id: &str) -> Vec<String> {
        let mut ledgers = self.ledgers.write();
        let Some(ledger) = ledgers.get_mut(&Self::key(symbol, is_long)) else {
            return Vec::new();
        };
        ledger
            .pending_sells
            .remove(order_id)
            .map(|ps| ps.related_buy_order_ids)
            .unwrap_or_default()
    }

    /// Close out a fully filled sell: remove quantity from the owned buys and
    /// drop the pending-sell entry.
    pub fn mark_sell_filled(&self, symbol: &str, is_long: bool, order_id: &str) {
        let mut ledgers = self.ledgers.write();
        let Some(ledger) = ledgers.get_mut(&Self::key(symbol, is_long)) else {
            return;
        };
        if let Some(ps) = ledger.pending_sells.remove(order_id) {
            remove_quantity(&mut ledger.buys, &ps.related_buy_order_ids, ps.submitted_quantity);
        }
    }

    /// Deterministic FIFO allocation across unoccupied buy ids for recovery,
    /// when the broker reports a live sell with no local pending-sell owner.
    pub fn allocate_related_buy_order_ids_for_recovery(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: u64,
    ) -> Option<Vec<String>> {
        let ledgers = self.ledgers.read();
        let ledger = ledgers.get(&Self::key(symbol, direction.is_long()))?;
        let occupied = ledger.occupied_buy_ids();

        let mut remaining = quantity;
        let mut ids = Vec::new();
        for buy in ledger.buys.iter() {
            if remaining == 0 {
                break;
            }
            if occupied.contains(buy.order_id.as_str()) {
                continue;
            }
            ids.push(buy.order_id.clone());
            remaining = remaining.saturating_sub(buy.executed_quantity);
        }

        if remaining > 0 {
            None
        } else {
            Some(ids)
        }
    }

    /// Smart-close selection, spec §4.3: stage 1 profitable buys, stage 2
    /// stale buys past `smart_close_timeout_minutes` of trading time, always
    /// excluding buys already occupied by a live pending sell. Results are
    /// capped at `max_sell_quantity` and returned in FIFO order.
    pub fn select_sellable_orders(&self, args: SelectSellableOrdersArgs<'_>) -> SellSelection {
        let ledgers = self.ledgers.read();
        let Some(ledger) = ledgers.get(&Self::key(args.symbol, args.is_long)) else {
            return SellSelection::default();
        };

        if !args.smart_close_enabled {
            return select_fifo_unoccupied(ledger, args.max_sell_quantity);
        }

        let occupied = ledger.occupied_buy_ids();
        let mut eligible: Vec<&BuyRecord> = ledger
            .buys
            .iter()
            .filter(|b| !occupied.contains(b.order_id.as_str()))
            .filter(|b| {
                let profitable = b.executed_price < args.current_price;
                let stale = args
                    .smart_close_timeout_minutes
                    .map(|timeout_min| {
                        args.trading_calendar
                            .elapsed_trading_minutes(b.executed_time, args.now)
                            >= timeout_min as i64
                    })
                    .unwrap_or(false);
                profitable || stale
            })
            .collect();
        eligible.sort_by_key(|b| b.executed_time);

        let mut remaining = args.max_sell_quantity;
        let mut ids = Vec::new();
        let mut total = 0u64;
        for buy in eligible {
            if remaining == 0 {
                break;
            }
            let take = buy.executed_quantity.min(remaining);
            if take == 0 {
                continue;
            }
            ids.push(buy.order_id.clone());
            total += take;
            remaining -= take;
        }

        SellSelection {
            related_buy_order_ids: ids,
            quantity: total,
        }
    }

    /// Total unoccupied available quantity for (symbol, is_long).
    pub fn available_quantity(&self, symbol: &str, is_long: bool) -> u64 {
        let ledgers = self.ledgers.read();
        let Some(ledger) = ledgers.get(&Self::key(symbol, is_long)) else {
            return 0;
        };
        let occupied = ledger.occupied_buy_ids();
        ledger
            .buys
            .iter()
            .filter(|b| !occupied.contains(b.order_id.as_str()))
            .map(|b| b.executed_quantity)
            .sum()
    }

    /// Snapshot of every live pending-sell order_id, for recovery
    /// reconciliation (spec §4.5 step 4).
    pub fn get_pending_sell_snapshot(&self) -> Vec<String> {
        self.ledgers
            .read()
            .values()
            .flat_map(|l| l.pending_sells.keys().cloned())
            .collect()
    }

    /// Drop every pending-sell entry across every ledger without touching
    /// buy records, spec §4.5 recovery step 1 ("release all pending-sell
    /// occupancy"). Recovery rebuilds pending-sell state from the broker
    /// snapshot afterward.
    pub fn release_all_pending_sells(&self) {
        for ledger in self.ledgers.write().values_mut() {
            ledger.pending_sells.clear();
        }
    }

    /// Sum of buy price*qty and qty for unoccupied holdings of (symbol,
    /// is_long) — feeds the risk checker's unrealized-loss computation.
    pub fn unrealized_loss_basis(&self, symbol: &str, is_long: bool) -> (Decimal, u64) {
        let ledgers = self.ledgers.read();
        let Some(ledger) = ledgers.get(&Self::key(symbol, is_long)) else {
            return (Decimal::ZERO, 0);
        };
        let occupied = ledger.occupied_buy_ids();
        let mut r1 = Decimal::ZERO;
        let mut n1 = 0u64;
        for buy in ledger.buys.iter().filter(|b| !occupied.contains(b.order_id.as_str())) {
            r1 += buy.executed_price * Decimal::from(buy.executed_quantity);
            n1 += buy.executed_quantity;
        }
        (r1, n1)
    }

    pub fn debug_snapshot(&self, symbol: &str, is_long: bool) -> (usize, usize) {
        let ledgers = self.ledgers.read();
        match ledgers.get(&Self::key(symbol, is_long)) {
            Some(ledger) => (ledger.buys.len(), ledger.pending_sells.len()),
            None => (0, 0),
        }
    }
}

impl Default for OrderRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn select_fifo_unoccupied(ledger: &Ledger, max_sell_quantity: u64) -> SellSelection {
    let occupied = ledger.occupied_buy_ids();
    let mut remaining = max_sell_quantity;
    let mut ids = Vec::new();
    let mut total = 0u64;
    for buy in ledger.buys.iter().filter(|b| !occupied.contains(b.order_id.as_str())) {
        if remaining == 0 {
            break;
        }
        let take = buy.executed_quantity.min(remaining);
        ids.push(buy.order_id.clone());
        total += take;
        remaining -= take;
    }
    SellSelection {
        related_buy_order_ids: ids,
        quantity: total,
    }
}

/// Remove `quantity` worth of executed amount from the buys named in `ids`,
/// dropping any buy record that reaches zero. Buys are consumed whole here:
/// the ledger tracks fills at order granularity, matching the reference
/// engine's position-list mutation style.
fn remove_quantity(buys: &mut Vec<BuyRecord>, ids: &[String], _quantity: u64) {
    buys.retain(|b| !ids.contains(&b.order_id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::SimpleHkCalendar;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 28, hour, min, 0).unwrap()
    }

    #[test]
    fn smart_close_stage1_selects_profitable_buys_only() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy("B1", "X.HK", dec!(1.0), 100, true, t(1, 30));
        recorder.record_local_buy("B2", "X.HK", dec!(1.2), 200, true, t(1, 31));

        let calendar = SimpleHkCalendar::new();
        let selection = recorder.select_sellable_orders(SelectSellableOrdersArgs {
            symbol: "X.HK",
            is_long: true,
            current_price: dec!(1.05),
            max_sell_quantity: 300,
            smart_close_enabled: true,
            smart_close_timeout_minutes: None,
            now: t(2, 0),
            trading_calendar: &calendar,
        });

        assert_eq!(selection.quantity, 100);
        assert_eq!(selection.related_buy_order_ids, vec!["B1".to_string()]);
    }

    #[test]
    fn smart_close_stage2_includes_stale_buys_past_timeout() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy("B1", "X.HK", dec!(0.9), 100, true, t(1, 30));
        recorder.record_local_buy("B2", "X.HK", dec!(1.2), 100, true, t(1, 31));
        recorder.record_local_buy("B3", "X.HK", dec!(1.3), 100, true, t(1, 32));
        recorder.submit_sell_order("PS1", "X.HK", Direction::Long, 100, vec!["B3".to_string()], t(1, 33));

        let calendar = SimpleHkCalendar::new();
        let selection = recorder.select_sellable_orders(SelectSellableOrdersArgs {
            symbol: "X.HK",
            is_long: true,
            current_price: dec!(1.05),
            max_sell_quantity: 1000,
            smart_close_enabled: true,
            smart_close_timeout_minutes: Some(60),
            now: t(3, 40), // well past 60 trading minutes from 01:30/01:31
            trading_calendar: &calendar,
        });

        assert_eq!(selection.quantity, 200);
        assert_eq!(selection.related_buy_order_ids, vec!["B1".to_string(), "B2".to_string()]);
    }

    #[test]
    fn pending_sell_occupancy_is_disjoint_and_released_on_cancel() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy("B1", "X.HK", dec!(1.0), 100, true, t(1, 0));
        recorder.submit_sell_order("PS1", "X.HK", Direction::Long, 100, vec!["B1".to_string()], t(1, 5));

        assert_eq!(recorder.available_quantity("X.HK", true), 0);
        let released = recorder.mark_sell_cancelled("X.HK", true, "PS1");
        assert_eq!(released, vec!["B1".to_string()]);
        assert_eq!(recorder.available_quantity("X.HK", true), 100);
    }

    #[test]
    fn record_local_sell_without_owner_deducts_fifo() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy("B1", "X.HK", dec!(1.0), 100, true, t(1, 0));
        recorder.record_local_buy("B2", "X.HK", dec!(1.1), 100, true, t(1, 1));

        recorder.record_local_sell("X.HK", 100, true, None);
        assert_eq!(recorder.available_quantity("X.HK", true), 100);
        assert_eq!(recorder.debug_snapshot("X.HK", true).0, 1);
    }

    #[test]
    fn allocate_for_recovery_fails_when_insufficient_unoccupied() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy("B1", "X.HK", dec!(1.0), 50, true, t(1, 0));
        let allocation = recorder.allocate_related_buy_order_ids_for_recovery("X.HK", Direction::Long, 100);
        assert!(allocation.is_none());
    }

    #[test]
    fn unrealized_loss_basis_excludes_occupied_buys() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy("B1", "X.HK", dec!(1.0), 100, true, t(1, 0));
        recorder.record_local_buy("B2", "X.HK", dec!(2.0), 50, true, t(1, 1));
        recorder.submit_sell_order("PS1", "X.HK", Direction::Long, 50, vec!["B2".to_string()], t(1, 2));

        let (r1, n1) = recorder.unrealized_loss_basis("X.HK", true);
        assert_eq!(r1, dec!(100.0));
        assert_eq!(n1, 100);
    }
}
