// =============================================================================
// Shared types used across the warrant trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::indicators::IndicatorSnapshot;

/// Which side of a monitor a seat trades: LONG (bull warrant) or SHORT (bear
/// warrant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn is_long(self) -> bool {
        matches!(self, Direction::Long)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Buy or sell side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

/// Seat status per spec §3: READY iff symbol is bound and not frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeatStatus {
    Ready,
    Searching,
    Switching,
    Empty,
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeatStatus::Ready => write!(f, "READY"),
            SeatStatus::Searching => write!(f, "SEARCHING"),
            SeatStatus::Switching => write!(f, "SWITCHING"),
            SeatStatus::Empty => write!(f, "EMPTY"),
        }
    }
}

/// Broker order type, per spec §6 `trading_order_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Limit order.
    Lo,
    /// Enhanced limit order — broker fills at submitted price or better.
    Elo,
    /// Market order.
    Mo,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Lo => write!(f, "LO"),
            OrderType::Elo => write!(f, "ELO"),
            OrderType::Mo => write!(f, "MO"),
        }
    }
}

/// Broker-reported order status. Active variants precede the terminal ones
/// per spec §4.5's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    WaitToNew,
    PartialFilled,
    Replaced,
    WaitToReplace,
    PendingReplace,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses are observed at most once per order_id (spec §8
    /// invariant 5) and cause the order to be dropped from tracking.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }

    /// Statuses recovery accepts as "still live" on the broker side.
    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::New => "New",
            OrderStatus::WaitToNew => "WaitToNew",
            OrderStatus::PartialFilled => "PartialFilled",
            OrderStatus::Replaced => "Replaced",
            OrderStatus::WaitToReplace => "WaitToReplace",
            OrderStatus::PendingReplace => "PendingReplace",
            OrderStatus::Filled => "Filled",
            OrderStatus::Canceled => "Canceled",
            OrderStatus::Rejected => "Rejected",
        };
        write!(f, "{s}")
    }
}

/// Signal action per spec §3 Signal data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    BuyCall,
    SellCall,
    BuyPut,
    SellPut,
    Hold,
}

impl SignalAction {
    pub fn side(self) -> Option<Side> {
        match self {
            SignalAction::BuyCall | SignalAction::BuyPut => Some(Side::Buy),
            SignalAction::SellCall | SignalAction::SellPut => Some(Side::Sell),
            SignalAction::Hold => None,
        }
    }

    /// Whether this action concerns the LONG (call) or SHORT (put) seat.
    pub fn direction(self) -> Option<Direction> {
        match self {
            SignalAction::BuyCall | SignalAction::SellCall => Some(Direction::Long),
            SignalAction::BuyPut | SignalAction::SellPut => Some(Direction::Short),
            SignalAction::Hold => None,
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalAction::BuyCall => "BUYCALL",
            SignalAction::SellCall => "SELLCALL",
            SignalAction::BuyPut => "BUYPUT",
            SignalAction::SellPut => "SELLPUT",
            SignalAction::Hold => "HOLD",
        };
        write!(f, "{s}")
    }
}

/// Day lifecycle state per spec §3/§4.12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Active,
    MidnightCleaning,
    MidnightCleaned,
    OpenRebuildFailed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Active => "ACTIVE",
            LifecycleState::MidnightCleaning => "MIDNIGHT_CLEANING",
            LifecycleState::MidnightCleaned => "MIDNIGHT_CLEANED",
            LifecycleState::OpenRebuildFailed => "OPEN_REBUILD_FAILED",
        };
        write!(f, "{s}")
    }
}

/// Order-monitor runtime phase per spec §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorRuntime {
    Bootstrapping,
    Active,
}

/// Liquidation cooldown configuration, per spec §6 `liquidation_cooldown`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationCooldown {
    Minutes(u32),
    HalfDay,
    OneDay,
}

/// Trade-log record status, per spec §6 persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeLogStatus {
    Submitted,
    Filled,
    Failed,
}

impl fmt::Display for TradeLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeLogStatus::Submitted => "SUBMITTED",
            TradeLogStatus::Filled => "FILLED",
            TradeLogStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Runtime gate mode, per spec §6 CLI: `strict` waits for a tradeable
/// session before starting the tick loop, `skip` starts immediately (dev).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Strict,
    Skip,
}

impl std::str::FromStr for GateMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(GateMode::Strict),
            "skip" => Ok(GateMode::Skip),
            other => anyhow::bail!("unknown gate mode '{other}' (expected strict|skip)"),
        }
    }
}

/// One verification re-check recorded against a delayed signal (spec §3
/// Signal `verification_history`), kept for operator diagnostics when a
/// signal is promoted or dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub checked_at: DateTime<Utc>,
    pub passed: bool,
}

/// A trading signal, spec §3 Data Model. Produced by the strategy, shaped by
/// the signal processor (sell-quantity resolution, risk gating), and
/// consumed by the order executor.
#[derive(Debug, Clone)]
pub struct Signal {
    pub symbol: String,
    pub action: SignalAction,
    pub reason: String,
    pub price: Decimal,
    pub lot_size: u64,
    /// Resolved order quantity. `None` until the executor (buys) or signal
    /// processor (sells, via `select_sellable_orders`) fills it in.
    pub quantity: Option<u64>,
    pub trigger_time: DateTime<Utc>,
    pub seat_version: u64,
    pub order_type_override: Option<OrderType>,
    pub is_protective_liquidation: bool,
    pub indicators_snapshot: IndicatorSnapshot,
    pub verification_history: Vec<VerificationRecord>,
    /// Sell-only: buy order_ids this sell would close out, resolved by
    /// `select_sellable_orders` before execution.
    pub related_buy_order_ids: Vec<String>,
}

impl Signal {
    pub fn monitor_direction(&self) -> Option<Direction> {
        self.action.direction()
    }
}

/// A tracked order under the order monitor's management, spec §3 Data
/// Model. Invariant: `executed_quantity <= submitted_quantity`.
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub is_long_symbol: bool,
    pub monitor_symbol: String,
    pub is_protective_liquidation: bool,
    pub order_type: OrderType,
    pub submitted_price: Option<Decimal>,
    pub submitted_quantity: u64,
    pub executed_quantity: u64,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub last_price_update_at: DateTime<Utc>,
    pub converted_to_market: bool,
}

impl TrackedOrder {
    /// Order types the price-chase loop is allowed to `replace_order` on.
    /// Market orders are never replaced; once a ELO/LO order has been
    /// converted to market it is never replaced either (spec §4.5).
    pub fn is_replaceable(&self) -> bool {
        !self.converted_to_market
            && self.order_type != OrderType::Mo
            && matches!(
                self.status,
                OrderStatus::New | OrderStatus::WaitToNew | OrderStatus::PartialFilled | OrderStatus::Replaced
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_terminal_classification() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartialFilled.is_terminal());
        assert!(OrderStatus::New.is_pending());
    }

    #[test]
    fn signal_action_maps_to_side_and_direction() {
        assert_eq!(SignalAction::BuyCall.side(), Some(Side::Buy));
        assert_eq!(SignalAction::BuyCall.direction(), Some(Direction::Long));
        assert_eq!(SignalAction::SellPut.side(), Some(Side::Sell));
        assert_eq!(SignalAction::SellPut.direction(), Some(Direction::Short));
        assert_eq!(SignalAction::Hold.side(), None);
        assert_eq!(SignalAction::Hold.direction(), None);
    }

    #[test]
    fn gate_mode_parses_case_insensitively() {
        assert_eq!("Strict".parse::<GateMode>().unwrap(), GateMode::Strict);
        assert_eq!("SKIP".parse::<GateMode>().unwrap(), GateMode::Skip);
        assert!("bogus".parse::<GateMode>().is_err());
    }

    fn sample_tracked(status: OrderStatus, order_type: OrderType, converted: bool) -> TrackedOrder {
        TrackedOrder {
            order_id: "T1".into(),
            symbol: "12345.HK".into(),
            side: Side::Buy,
            is_long_symbol: true,
            monitor_symbol: "HSI".into(),
            is_protective_liquidation: false,
            order_type,
            submitted_price: Some(rust_decimal::Decimal::ONE),
            submitted_quantity: 100,
            executed_quantity: 0,
            status,
            submitted_at: Utc::now(),
            last_price_update_at: Utc::now(),
            converted_to_market: converted,
        }
    }

    #[test]
    fn replaceable_excludes_market_orders_and_converted_and_terminal() {
        assert!(sample_tracked(OrderStatus::New, OrderType::Elo, false).is_replaceable());
        assert!(!sample_tracked(OrderStatus::New, OrderType::Mo, false).is_replaceable());
        assert!(!sample_tracked(OrderStatus::New, OrderType::Elo, true).is_replaceable());
        assert!(!sample_tracked(OrderStatus::Filled, OrderType::Elo, false).is_replaceable());
        assert!(sample_tracked(OrderStatus::PartialFilled, OrderType::Elo, false).is_replaceable());
    }
}
