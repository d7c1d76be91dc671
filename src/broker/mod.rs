// =============================================================================
// Broker adapter — external collaborator, spec §6
// =============================================================================
//
// The broker SDK itself is out of scope (spec §1): we define the narrow
// quote/trade capability the engine actually calls through, modeled on the
// Longbridge-style quote/trade context split named in spec §6, and consume
// it as `Arc<dyn QuoteContext>` / `Arc<dyn TradeContext>` so the control
// plane never depends on a concrete SDK. `async-trait` makes these object
// safe, the same pattern the wider example pack reaches for whenever an
// async capability needs to be swapped for a test double.
// =============================================================================

pub mod live;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, OrderType, Side};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub last_done: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candlestick {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarrantListing {
    pub symbol: String,
    pub call_price: Decimal,
    pub is_long: bool,
    pub last_trade_day: NaiveDate,
    pub lot_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayload {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacePayload {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedOrder {
    pub order_id: String,
}

/// Broker push event for a tracked order (spec §4.5 input).
#[derive(Debug, Clone)]
pub struct OrderChanged {
    pub order_id: String,
    pub status: OrderStatus,
    pub executed_price: Option<Decimal>,
    pub executed_quantity: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountBalance {
    pub available_cash: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockPosition {
    pub symbol: String,
    pub quantity: u64,
    pub is_long: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub quantity: u64,
    pub executed_quantity: u64,
}

/// Quote-side capability: subscriptions, candles, warrant discovery, and
/// calendar lookups (spec §6 "Quote context").
#[async_trait]
pub trait QuoteContext: Send + Sync {
    async fn subscribe_symbols(&self, symbols: &[String]) -> anyhow::Result<()>;
    async fn unsubscribe_symbols(&self, symbols: &[String]) -> anyhow::Result<()>;
    async fn get_quotes(&self, symbols: &[String]) -> anyhow::Result<Vec<(String, Quote)>>;
    async fn subscribe_candlesticks(&self, symbol: &str) -> anyhow::Result<()>;
    async fn get_realtime_candlesticks(&self, symbol: &str, count: u32) -> anyhow::Result<Vec<Candlestick>>;
    async fn warrant_list(&self, underlying: &str, is_long: bool) -> anyhow::Result<Vec<WarrantListing>>;
    async fn is_trading_day(&self, date: NaiveDate) -> anyhow::Result<bool>;
    async fn get_trading_days(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<NaiveDate>>;
}

/// Trade-side capability: order placement and account/position truth (spec
/// §6 "Trade context").
#[async_trait]
pub trait TradeContext: Send + Sync {
    async fn submit_order(&self, payload: OrderPayload) -> anyhow::Result<SubmittedOrder>;
    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()>;
    async fn replace_order(&self, payload: ReplacePayload) -> anyhow::Result<()>;
    async fn account_balance(&self) -> anyhow::Result<AccountBalance>;
    async fn stock_positions(&self, symbols: Option<&[String]>) -> anyhow::Result<Vec<StockPosition>>;
    async fn today_orders(&self, symbol: Option<&str>) -> anyhow::Result<Vec<OpenOrder>>;

    /// Subscribe to the broker's private order-change push stream. Returns
    /// a receiver the order monitor drains; replaces the reference
    /// interface's callback-registration shape (`set_on_order_changed`)
    /// with an owned channel, the idiomatic Rust equivalent.
    fn subscribe_order_changed(&self) -> mpsc::Receiver<OrderChanged>;
}
