// =============================================================================
// Application state — control-plane composition root
// =============================================================================
//
// A single `AppState` owns `Arc`-wrapped handles to every component (spec
// §4) plus the caches the orchestrator needs between ticks (indicator
// snapshots keyed by candle fingerprint, resolved lot sizes, the currently
// subscribed symbol set). Grounded on the reference engine's `AppState`: one
// struct composing every subsystem behind `Arc`/`RwLock`, constructed once in
// `new()` from config, with no business logic of its own — only ownership and
// cheap accessors.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::auto_symbol::AutoSymbolManager;
use crate::broker::{QuoteContext, TradeContext};
use crate::calendar::{SimpleHkCalendar, TradingCalendar};
use crate::config::EngineConfig;
use crate::executor::{ExecutionGate, OrderExecutor, SymbolMeta};
use crate::indicators::{DefaultIndicatorEngine, IndicatorEngine, IndicatorSnapshot};
use crate::lifecycle::{DayLifecycleManager, NoopDomain};
use crate::market_data::{CandleBuffer, CandleFingerprint};
use crate::order_monitor::OrderMonitor;
use crate::order_recorder::OrderRecorder;
use crate::rate_limiter::RateLimiter;
use crate::registry::SeatKey;
use crate::registry::SymbolRegistry;
use crate::risk::RiskChecker;
use crate::task_queue::TaskQueue;
use crate::trade_log::TradeLog;
use crate::types::Signal;
use crate::verifier::DelayedSignalVerifier;

/// A manual kill switch an operator can flip at runtime; consulted by the
/// executor and order monitor in addition to the day lifecycle's own
/// trading-enabled flag (spec §4.6 "an external `is_execution_allowed()`
/// callback, may toggle mid-tick").
pub struct ManualGate {
    allowed: AtomicBool,
}

impl ManualGate {
    pub fn new() -> Self {
        Self { allowed: AtomicBool::new(true) }
    }

    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
    }
}

impl Default for ManualGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionGate for ManualGate {
    fn is_execution_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }
}

/// Everything the control plane needs between ticks that isn't owned by one
/// of the named components: cached indicator snapshots (invalidated by candle
/// fingerprint), resolved lot sizes per traded symbol, and the symbol set
/// currently subscribed at the quote context.
pub struct TickCaches {
    pub indicator_snapshots: RwLock<HashMap<String, (CandleFingerprint, IndicatorSnapshot)>>,
    pub symbol_meta: RwLock<HashMap<String, SymbolMeta>>,
    pub subscribed_symbols: RwLock<HashSet<String>>,
}

impl TickCaches {
    fn new() -> Self {
        Self {
            indicator_snapshots: RwLock::new(HashMap::new()),
            symbol_meta: RwLock::new(HashMap::new()),
            subscribed_symbols: RwLock::new(HashSet::new()),
        }
    }
}

pub struct AppState {
    pub config: RwLock<EngineConfig>,
    pub quote: Arc<dyn QuoteContext>,
    pub trade: Arc<dyn TradeContext>,

    pub registry: Arc<SymbolRegistry>,
    pub order_recorder: Arc<OrderRecorder>,
    pub risk: Arc<RiskChecker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub order_monitor: Arc<OrderMonitor>,
    pub executor: Arc<OrderExecutor>,
    pub auto_symbol: Arc<AutoSymbolManager>,
    pub verifier: Arc<DelayedSignalVerifier>,
    pub lifecycle: Arc<DayLifecycleManager>,
    pub candle_buffer: Arc<CandleBuffer>,
    pub indicator_engine: Arc<dyn IndicatorEngine>,
    pub calendar: Arc<dyn TradingCalendar>,
    pub execution_gate: Arc<ManualGate>,
    pub trade_log: Arc<TradeLog>,

    /// Buy/sell/monitor task queues, spec §4.10. Buy and sell carry resolved
    /// `Signal`s dedup-keyed by (monitor, direction, action); the monitor
    /// queue (chase) carries the latest quotes map for the price-chase pass.
    pub buy_queue: Arc<TaskQueue<Signal>>,
    pub sell_queue: Arc<TaskQueue<Signal>>,
    pub monitor_queue: Arc<TaskQueue<HashMap<String, Decimal>>>,
    /// Not one of the three named queues: carries auto-symbol search/switch
    /// ticks, dedup-keyed by seat so a seat's in-flight task is never
    /// duplicated across orchestrator passes.
    pub auto_symbol_queue: Arc<TaskQueue<SeatKey>>,
    pub post_trade_refresh_queue: Arc<TaskQueue<String>>,

    pub caches: TickCaches,
    pub state_version: AtomicU64,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: EngineConfig,
        quote: Arc<dyn QuoteContext>,
        trade: Arc<dyn TradeContext>,
        trade_log_dir: impl Into<std::path::PathBuf>,
    ) -> Arc<Self> {
        let registry = Arc::new(SymbolRegistry::new());
        let order_recorder = Arc::new(OrderRecorder::new());
        let risk = Arc::new(RiskChecker::new());
        let rate_limiter = Arc::new(RateLimiter::new(config.global.rate_limit_max_calls, config.global.rate_limit_window_ms));
        let order_monitor = Arc::new(OrderMonitor::new(trade.clone(), rate_limiter.clone(), order_recorder.clone(), registry.clone()));
        let executor = Arc::new(OrderExecutor::new(trade.clone(), rate_limiter.clone(), order_recorder.clone(), order_monitor.clone()));
        let auto_symbol = Arc::new(AutoSymbolManager::new(
            quote.clone(),
            trade.clone(),
            rate_limiter.clone(),
            registry.clone(),
            order_recorder.clone(),
            risk.clone(),
            order_monitor.clone(),
        ));
        let verifier = Arc::new(DelayedSignalVerifier::new());
        let candle_buffer = Arc::new(CandleBuffer::new(200));
        let indicator_engine: Arc<dyn IndicatorEngine> = Arc::new(DefaultIndicatorEngine);
        let calendar: Arc<dyn TradingCalendar> = Arc::new(SimpleHkCalendar::new());

        // Cache domains participate in the daily clear/rebuild cycle in
        // registration order; none of the existing components need anything
        // beyond a no-op today (their state is either re-derived from
        // broker truth on open or naturally resets via seat clearing), but
        // the slots are named so a future domain with real teardown/rebuild
        // work only has to implement `LifecycleDomain`, not wire a new list.
        let domains: Vec<Box<dyn crate::lifecycle::LifecycleDomain>> = vec![
            Box::new(NoopDomain::new("symbol_registry")),
            Box::new(NoopDomain::new("order_recorder")),
            Box::new(NoopDomain::new("risk_checker")),
            Box::new(NoopDomain::new("candle_buffer")),
        ];
        let lifecycle = Arc::new(DayLifecycleManager::new(domains, config.global.rebuild_retry_delay_ms));

        Arc::new(Self {
            config: RwLock::new(config),
            quote,
            trade,
            registry,
            order_recorder,
            risk,
            rate_limiter,
            order_monitor,
            executor,
            auto_symbol,
            verifier,
            lifecycle,
            candle_buffer,
            indicator_engine,
            calendar,
            execution_gate: Arc::new(ManualGate::new()),
            trade_log: Arc::new(TradeLog::new(trade_log_dir)),
            buy_queue: Arc::new(TaskQueue::new()),
            sell_queue: Arc::new(TaskQueue::new()),
            monitor_queue: Arc::new(TaskQueue::new()),
            auto_symbol_queue: Arc::new(TaskQueue::new()),
            post_trade_refresh_queue: Arc::new(TaskQueue::new()),
            caches: TickCaches::new(),
            state_version: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    pub fn bump_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
