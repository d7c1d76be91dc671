// =============================================================================
// MockBroker — test double for QuoteContext + TradeContext
// =============================================================================
//
// Drives end-to-end scenario tests (spec §8 S1-S7) without a network call.
// Tests seed quotes/warrant lists/positions, drive pushes through
// `push_order_changed`, and inspect `submitted_orders()`/`cancelled_order_ids()`
// afterward. Grounded on the reference engine's preference for a plain
// `RwLock`-backed struct over a mocking framework.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{
    AccountBalance, Candlestick, OpenOrder, OrderChanged, OrderPayload, Quote, QuoteContext,
    ReplacePayload, StockPosition, SubmittedOrder, TradeContext, WarrantListing,
};

pub struct MockBroker {
    quotes: RwLock<HashMap<String, Quote>>,
    warrant_lists: RwLock<HashMap<String, Vec<WarrantListing>>>,
    trading_days: RwLock<Vec<NaiveDate>>,
    account: RwLock<AccountBalance>,
    positions: RwLock<Vec<StockPosition>>,
    submitted: RwLock<Vec<OrderPayload>>,
    open_orders: RwLock<HashMap<String, OpenOrder>>,
    cancelled: RwLock<Vec<String>>,
    replaced: RwLock<Vec<ReplacePayload>>,
    next_order_id: AtomicU64,
    push_tx: mpsc::Sender<OrderChanged>,
    push_rx: Mutex<Option<mpsc::Receiver<OrderChanged>>>,
    /// When true, `submit_order` fails — used by tests simulating a
    /// transient broker error or execution-gate race (S6).
    pub reject_submits: std::sync::atomic::AtomicBool,
}

impl MockBroker {
    pub fn new() -> Self {
        let (push_tx, push_rx) = mpsc::channel(256);
        Self {
            quotes: RwLock::new(HashMap::new()),
            warrant_lists: RwLock::new(HashMap::new()),
            trading_days: RwLock::new(Vec::new()),
            account: RwLock::new(AccountBalance { available_cash: rust_decimal::Decimal::new(1_000_000, 0) }),
            positions: RwLock::new(Vec::new()),
            submitted: RwLock::new(Vec::new()),
            open_orders: RwLock::new(HashMap::new()),
            cancelled: RwLock::new(Vec::new()),
            replaced: RwLock::new(Vec::new()),
            next_order_id: AtomicU64::new(1),
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
            reject_submits: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_quote(&self, symbol: &str, last_done: rust_decimal::Decimal) {
        self.quotes.write().insert(
            symbol.to_string(),
            Quote { last_done, timestamp: Utc::now() },
        );
    }

    pub fn set_warrant_list(&self, underlying: &str, is_long: bool, listings: Vec<WarrantListing>) {
        self.warrant_lists
            .write()
            .insert(format!("{underlying}:{is_long}"), listings);
    }

    pub fn set_account(&self, available_cash: rust_decimal::Decimal) {
        self.account.write().available_cash = available_cash;
    }

    pub fn set_positions(&self, positions: Vec<StockPosition>) {
        *self.positions.write() = positions;
    }

    pub fn submitted_orders(&self) -> Vec<OrderPayload> {
        self.submitted.read().clone()
    }

    pub fn cancelled_order_ids(&self) -> Vec<String> {
        self.cancelled.read().clone()
    }

    pub fn replaced_orders(&self) -> Vec<ReplacePayload> {
        self.replaced.read().clone()
    }

    /// Push a broker order-change event to whichever receiver is holding the
    /// channel (the order monitor, in tests that wired it up).
    pub async fn push_order_changed(&self, event: OrderChanged) {
        self.push_tx.send(event).await.expect("push channel closed");
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuoteContext for MockBroker {
    async fn subscribe_symbols(&self, _symbols: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unsubscribe_symbols(&self, _symbols: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_quotes(&self, symbols: &[String]) -> anyhow::Result<Vec<(String, Quote)>> {
        let quotes = self.quotes.read();
        Ok(symbols
            .iter()
            .filter_map(|s| quotes.get(s).map(|q| (s.clone(), *q)))
            .collect())
    }

    async fn subscribe_candlesticks(&self, _symbol: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_realtime_candlesticks(&self, _symbol: &str, _count: u32) -> anyhow::Result<Vec<Candlestick>> {
        Ok(Vec::new())
    }

    async fn warrant_list(&self, underlying: &str, is_long: bool) -> anyhow::Result<Vec<WarrantListing>> {
        Ok(self
            .warrant_lists
            .read()
            .get(&format!("{underlying}:{is_long}"))
            .cloned()
            .unwrap_or_default())
    }

    async fn is_trading_day(&self, date: NaiveDate) -> anyhow::Result<bool> {
        Ok(self.trading_days.read().contains(&date))
    }

    async fn get_trading_days(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<NaiveDate>> {
        Ok(self
            .trading_days
            .read()
            .iter()
            .filter(|d| **d >= from && **d <= to)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TradeContext for MockBroker {
    async fn submit_order(&self, payload: OrderPayload) -> anyhow::Result<SubmittedOrder> {
        if self.reject_submits.load(Ordering::SeqCst) {
            anyhow::bail!("mock broker rejected submit");
        }
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("MOCK-{id}");
        self.open_orders.write().insert(
            order_id.clone(),
            OpenOrder {
                order_id: order_id.clone(),
                symbol: payload.symbol.clone(),
                side: payload.side,
                status: crate::types::OrderStatus::New,
                price: payload.price,
                quantity: payload.quantity,
                executed_quantity: 0,
            },
        );
        self.submitted.write().push(payload);
        Ok(SubmittedOrder { order_id })
    }

    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()> {
        self.open_orders.write().remove(order_id);
        self.cancelled.write().push(order_id.to_string());
        Ok(())
    }

    async fn replace_order(&self, payload: ReplacePayload) -> anyhow::Result<()> {
        if let Some(order) = self.open_orders.write().get_mut(&payload.order_id) {
            order.price = Some(payload.price);
            order.quantity = payload.quantity;
        }
        self.replaced.write().push(payload);
        Ok(())
    }

    async fn account_balance(&self) -> anyhow::Result<AccountBalance> {
        Ok(*self.account.read())
    }

    async fn stock_positions(&self, symbols: Option<&[String]>) -> anyhow::Result<Vec<StockPosition>> {
        let positions = self.positions.read();
        Ok(match symbols {
            Some(filter) => positions.iter().filter(|p| filter.contains(&p.symbol)).cloned().collect(),
            None => positions.clone(),
        })
    }

    async fn today_orders(&self, symbol: Option<&str>) -> anyhow::Result<Vec<OpenOrder>> {
        let orders = self.open_orders.read();
        Ok(orders
            .values()
            .filter(|o| symbol.map(|s| s == o.symbol).unwrap_or(true))
            .cloned()
            .collect())
    }

    fn subscribe_order_changed(&self) -> mpsc::Receiver<OrderChanged> {
        self.push_rx
            .lock()
            .take()
            .expect("MockBroker::subscribe_order_changed called more than once")
    }
}
