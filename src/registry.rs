// =============================================================================
// Symbol registry — spec §4.2 (C2)
// =============================================================================
//
// Owns every Seat keyed by (monitor_symbol, direction). `seat_version` is
// bumped only when the bound symbol changes (spec §3 invariant); consumers
// carry a seat_version snapshot through async tasks and skip themselves if
// the registry has since moved on. Built on the same `RwLock<HashMap<...>>`
// idiom the reference engine uses for `CandleBuffer` and `PositionManager`.
// =============================================================================

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use crate::types::{Direction, SeatStatus};

/// Key identifying one seat: a monitor underlying plus a trading direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeatKey {
    pub monitor_symbol: String,
    pub direction: Direction,
}

impl fmt::Display for SeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.monitor_symbol, self.direction)
    }
}

/// One LONG or SHORT seat for a monitor, per spec §3 Data Model.
#[derive(Debug, Clone)]
pub struct Seat {
    pub symbol: Option<String>,
    pub status: SeatStatus,
    pub last_switch_at: Option<DateTime<Utc>>,
    pub last_search_at: Option<DateTime<Utc>>,
    pub last_seat_ready_at: Option<DateTime<Utc>>,
    pub call_price: Option<Decimal>,
    pub search_fail_count_today: u32,
    pub frozen_trading_day_key: Option<String>,
    /// Monotonically increasing, bumped only on a binding change (symbol
    /// value differs from the previous one).
    pub seat_version: u64,
}

impl Seat {
    fn empty() -> Self {
        Self {
            symbol: None,
            status: SeatStatus::Empty,
            last_switch_at: None,
            last_search_at: None,
            last_seat_ready_at: None,
            call_price: None,
            search_fail_count_today: 0,
            frozen_trading_day_key: None,
            seat_version: 0,
        }
    }

    /// `status=READY` iff bound to a symbol and not frozen today (spec §3
    /// invariant).
    pub fn is_ready(&self) -> bool {
        self.status == SeatStatus::Ready && self.symbol.is_some()
    }

    pub fn is_frozen_for(&self, trading_day_key: &str) -> bool {
        self.frozen_trading_day_key.as_deref() == Some(trading_day_key)
    }
}

/// A full mutation to apply to a seat in one call, so the caller doesn't
/// read-modify-write across two lock acquisitions. `None` fields are left
/// unchanged; `symbol: Some(None)` explicitly clears the binding.
#[derive(Debug, Clone, Default)]
pub struct SeatUpdate {
    pub symbol: Option<Option<String>>,
    pub status: Option<SeatStatus>,
    pub last_switch_at: Option<DateTime<Utc>>,
    pub last_search_at: Option<DateTime<Utc>>,
    pub last_seat_ready_at: Option<DateTime<Utc>>,
    pub call_price: Option<Option<Decimal>>,
    pub search_fail_count_today: Option<u32>,
    pub frozen_trading_day_key: Option<Option<String>>,
}

/// Registry of every (monitor, direction) seat. Resolution by symbol is a
/// linear scan, per spec §4.2 — the registry is small (a handful of monitors
/// times two directions), so this trades a negligible constant for not
/// maintaining a second reverse index that could drift.
pub struct SymbolRegistry {
    seats: RwLock<HashMap<SeatKey, Seat>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self {
            seats: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure a seat exists for (monitor_symbol, direction), creating an
    /// EMPTY one if absent. Called during startup seat preparation.
    pub fn ensure_seat(&self, monitor_symbol: &str, direction: Direction) {
        let key = SeatKey {
            monitor_symbol: monitor_symbol.to_string(),
            direction,
        };
        self.seats.write().entry(key).or_insert_with(Seat::empty);
    }

    pub fn get_seat_state(&self, monitor_symbol: &str, direction: Direction) -> Option<Seat> {
        let key = SeatKey {
            monitor_symbol: monitor_symbol.to_string(),
            direction,
        };
        self.seats.read().get(&key).cloned()
    }

    pub fn get_seat_version(&self, monitor_symbol: &str, direction: Direction) -> u64 {
        self.get_seat_state(monitor_symbol, direction)
            .map(|s| s.seat_version)
            .unwrap_or(0)
    }

    /// Apply `update` to the seat, bumping `seat_version` iff the bound
    /// symbol actually changes. Returns the seat's state after the update.
    pub fn update_seat_state(
        &self,
        monitor_symbol: &str,
        direction: Direction,
        update: SeatUpdate,
    ) -> Seat {
        let key = SeatKey {
            monitor_symbol: monitor_symbol.to_string(),
            direction,
        };
        let mut seats = self.seats.write();
        let seat = seats.entry(key.clone()).or_insert_with(Seat::empty);

        if let Some(new_symbol) = update.symbol {
            if new_symbol != seat.symbol {
                seat.symbol = new_symbol;
                seat.seat_version += 1;
                debug!(seat = %key, version = seat.seat_version, "seat binding changed");
            }
        }
        if let Some(status) = update.status {
            seat.status = status;
        }
        if let Some(t) = update.last_switch_at {
            seat.last_switch_at = Some(t);
        }
        if let Some(t) = update.last_search_at {
            seat.last_search_at = Some(t);
        }
        if let Some(t) = update.last_seat_ready_at {
            seat.last_seat_ready_at = Some(t);
        }
        if let Some(price) = update.call_price {
            seat.call_price = price;
        }
        if let Some(n) = update.search_fail_count_today {
            seat.search_fail_count_today = n;
        }
        if let Some(frozen) = update.frozen_trading_day_key {
            seat.frozen_trading_day_key = frozen;
        }

        seat.clone()
    }

    /// Force a version bump without changing any other field — used when a
    /// status transition (e.g. READY→SEARCHING) must invalidate
    /// in-flight tasks even though the bound symbol has not changed yet.
    pub fn bump_seat_version(&self, monitor_symbol: &str, direction: Direction) -> u64 {
        let key = SeatKey {
            monitor_symbol: monitor_symbol.to_string(),
            direction,
        };
        let mut seats = self.seats.write();
        let seat = seats.entry(key).or_insert_with(Seat::empty);
        seat.seat_version += 1;
        seat.seat_version
    }

    /// Linear scan for the seat currently bound to `symbol`, used by push
    /// reconciliation which only has a traded symbol to go on.
    pub fn resolve_seat_by_symbol(&self, symbol: &str) -> Option<(SeatKey, Seat)> {
        self.seats
            .read()
            .iter()
            .find(|(_, seat)| seat.symbol.as_deref() == Some(symbol))
            .map(|(k, s)| (k.clone(), s.clone()))
    }

    pub fn all_seats(&self) -> Vec<(SeatKey, Seat)> {
        self.seats
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect()
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
