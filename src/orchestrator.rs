// =============================================================================
// Per-tick orchestrator — spec §4.11 (C11)
// =============================================================================
//
// One `run_tick` call drives the whole control plane through its ordered
// per-tick pass: day lifecycle, session gate, open protection, symbol
// subscription diffing, doomsday protection, quote/indicator refresh,
// strategy evaluation, and task scheduling. Everything that can suspend
// (broker calls, rate-limiter throttling, delayed-signal timers) happens
// off this path, in the task processors spawned alongside it — `run_tick`
// itself only reads caches, mutates in-memory state, and enqueues work.
//
// Grounded on the reference engine's own strategy-loop spawn in `main.rs`
// (`interval.tick()` driving `StrategyEngine::evaluate_symbol` once per
// symbol per tick, decisions pushed to a queue rather than executed
// inline) generalized from a flat per-symbol loop into the staged,
// subscription-aware pass spec §4.11 names.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broker::{Candlestick, OrderChanged};
use crate::calendar::is_continuous_hk_session;
use crate::executor::{ExecuteArgs, ExecutionOutcome};
use crate::order_monitor::{ChaseArgs, MonitorEvent};
use crate::registry::SeatKey;
use crate::risk::{AccountSnapshot, PositionSnapshot};
use crate::strategy::{MonitorPrices, ProcessSellArgs, SignalProcessor, StrategyEngine};
use crate::task_queue::Task;
use crate::trade_log::TradeLogRecord;
use crate::types::{Direction, LifecycleState, OrderType, Side, Signal, SignalAction, TradeLogStatus};
use crate::verifier::VerificationOutcome;

/// Diagnostic return value so callers (including tests) can observe why a
/// tick stopped early without re-deriving it from logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    MidnightCleaningInProgress,
    OutsideSession,
    DoomsdayClearanceTriggered,
    Completed,
}

fn day_key(now: DateTime<Utc>) -> String {
    now.date_naive().format("%Y-%m-%d").to_string()
}

/// Run exactly one pass of the control-plane tick, spec §4.11 steps 1-8.
pub async fn run_tick(state: &Arc<AppState>, now: DateTime<Utc>) -> TickOutcome {
    // Step 1: advance day lifecycle.
    let date = now.date_naive();
    let is_tradeable_day = state.calendar.is_trading_day(date);
    state.lifecycle.tick(&day_key(now), is_tradeable_day, now).await;
    let lifecycle_snapshot = state.lifecycle.snapshot();
    if lifecycle_snapshot.state == LifecycleState::MidnightCleaning {
        return TickOutcome::MidnightCleaningInProgress;
    }

    // Step 2: session gate.
    let is_half_day = state.calendar.is_half_day(date);
    let in_session = is_tradeable_day && is_continuous_hk_session(now, is_half_day) && lifecycle_snapshot.is_trading_enabled;
    if !in_session {
        let cancelled = state.verifier.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "left trading session, delayed signals cancelled");
        }
        return TickOutcome::OutsideSession;
    }

    // Step 3: open-protection flag for the current half-session.
    let is_open_protection = compute_open_protection(state, now);

    // Step 4: subscription diffing.
    let trading_day_key = day_key(now);
    reconcile_subscriptions(state).await;

    // Step 5: doomsday protection.
    if state.config.read().global.doomsday_protection && run_doomsday_protection(state, now, is_half_day).await {
        return TickOutcome::DoomsdayClearanceTriggered;
    }

    // Step 6 + 7: per-monitor quote/indicator refresh, strategy, scheduling.
    let monitors = state.config.read().monitors.clone();
    let all_symbols = all_trading_symbols(state, &monitors);
    let quotes = batch_fetch_quotes(state, &all_symbols).await;

    for monitor in &monitors {
        run_monitor_pass(state, monitor, &quotes, is_open_protection, &trading_day_key, now).await;
    }

    // Step 8: schedule the price-chase pass and any post-trade refresh.
    if !quotes.is_empty() {
        state.monitor_queue.schedule_latest(Task { dedupe_key: "chase".to_string(), payload: quotes });
    }
    for symbol in state.order_monitor.take_pending_refresh_symbols() {
        state.post_trade_refresh_queue.schedule_latest(Task { dedupe_key: symbol.clone(), payload: symbol });
    }

    TickOutcome::Completed
}

/// Minutes elapsed since the currently active half-session's open, plus
/// whether that half-session is the afternoon one — derived from the
/// calendar's own session boundaries rather than hardcoded HK times, so a
/// custom `TradingCalendar` (alternate holidays, half days) is honored.
fn minutes_since_session_open(state: &Arc<AppState>, now: DateTime<Utc>) -> Option<(i64, bool)> {
    let sessions = state.calendar.sessions(now.date_naive());
    sessions
        .into_iter()
        .enumerate()
        .find(|(_, (open, close))| now >= *open && now <= *close)
        .map(|(i, (open, _))| ((now - open).num_minutes(), i > 0))
}

fn compute_open_protection(state: &Arc<AppState>, now: DateTime<Utc>) -> bool {
    let Some((elapsed, in_afternoon)) = minutes_since_session_open(state, now) else { return false };
    let config = state.config.read();
    let window = if in_afternoon { &config.global.open_protection.afternoon } else { &config.global.open_protection.morning };
    window.enabled && elapsed < window.minutes as i64
}

/// Union of configured monitor warrant symbols, symbols bound to a ready or
/// switching seat, symbols currently held as a position, and symbols with a
/// live order — spec §4.11 step 4's `all_trading_symbols`.
fn all_trading_symbols(state: &Arc<AppState>, monitors: &[crate::config::MonitorConfig]) -> HashSet<String> {
    let mut symbols = HashSet::new();
    for monitor in monitors {
        symbols.insert(monitor.monitor_symbol.clone());
        if let Some(s) = &monitor.long_symbol {
            symbols.insert(s.clone());
        }
        if let Some(s) = &monitor.short_symbol {
            symbols.insert(s.clone());
        }
    }
    for (_, seat) in state.registry.all_seats() {
        if let Some(symbol) = seat.symbol {
            symbols.insert(symbol);
        }
    }
    for order in state.order_monitor.tracked_orders_snapshot() {
        symbols.insert(order.symbol);
    }
    symbols
}

async fn reconcile_subscriptions(state: &Arc<AppState>) {
    let monitors = state.config.read().monitors.clone();
    let target = all_trading_symbols(state, &monitors);

    let held_or_on_order: HashSet<String> = match state.trade.stock_positions(None).await {
        Ok(positions) => positions.into_iter().map(|p| p.symbol).collect(),
        Err(e) => {
            warn!(error = %e, "failed to fetch positions for subscription reconciliation");
            HashSet::new()
        }
    };

    let mut subscribed = state.caches.subscribed_symbols.write();
    let to_add: Vec<String> = target.difference(&subscribed).cloned().collect();
    let to_remove: Vec<String> = subscribed
        .difference(&target)
        .filter(|s| !held_or_on_order.contains(*s))
        .cloned()
        .collect();

    if !to_add.is_empty() {
        if let Err(e) = state.quote.subscribe_symbols(&to_add).await {
            warn!(error = %e, symbols = ?to_add, "failed to subscribe symbols");
        } else {
            subscribed.extend(to_add);
        }
    }
    if !to_remove.is_empty() {
        if let Err(e) = state.quote.unsubscribe_symbols(&to_remove).await {
            warn!(error = %e, symbols = ?to_remove, "failed to unsubscribe symbols");
        } else {
            for s in &to_remove {
                subscribed.remove(s);
            }
        }
    }
}

/// Cancel pending buys in the run-up to close and, inside the final
/// minutes, clear every still-open position regardless of the configured
/// strategy — spec §4.11 step 5. Returns `true` if the final-window
/// clearance fired (short-circuits the rest of the tick).
async fn run_doomsday_protection(state: &Arc<AppState>, now: DateTime<Utc>, is_half_day: bool) -> bool {
    let date = now.date_naive();
    let close = if is_half_day {
        state.calendar.sessions(date).into_iter().next().map(|(_, e)| e)
    } else {
        state.calendar.sessions(date).into_iter().last().map(|(_, e)| e)
    };
    let Some(close) = close else { return false };
    let minutes_to_close = (close - now).num_minutes();

    const FINAL_WINDOW_MINUTES: i64 = 2;
    const CANCEL_BUYS_WINDOW_MINUTES: i64 = 10;

    if (0..=FINAL_WINDOW_MINUTES).contains(&minutes_to_close) {
        warn!(minutes_to_close, "doomsday final window reached, clearing all open positions");
        clear_all_positions(state, now).await;
        return true;
    }

    if minutes_to_close > FINAL_WINDOW_MINUTES && minutes_to_close <= CANCEL_BUYS_WINDOW_MINUTES {
        for order in state.order_monitor.tracked_orders_snapshot() {
            if order.side == Side::Buy && order.is_replaceable() {
                if let Err(e) = state.executor.cancel_order(&order.order_id).await {
                    warn!(order_id = %order.order_id, error = %e, "doomsday buy cancel failed");
                }
            }
        }
    }

    false
}

async fn clear_all_positions(state: &Arc<AppState>, now: DateTime<Utc>) {
    let positions = match state.trade.stock_positions(None).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "doomsday clearance could not fetch positions");
            return;
        }
    };
    for position in positions {
        if position.quantity == 0 {
            continue;
        }
        let direction = if position.is_long { Direction::Long } else { Direction::Short };
        let action = if position.is_long { SignalAction::SellCall } else { SignalAction::SellPut };
        let signal = Signal {
            symbol: position.symbol.clone(),
            action,
            reason: "doomsday protection clearance".to_string(),
            price: Decimal::ZERO,
            lot_size: 0,
            quantity: Some(position.quantity),
            trigger_time: now,
            seat_version: state.registry.get_seat_version(&position.symbol, direction),
            order_type_override: Some(OrderType::Mo),
            is_protective_liquidation: true,
            indicators_snapshot: crate::indicators::IndicatorSnapshot::new(),
            verification_history: Vec::new(),
            related_buy_order_ids: Vec::new(),
        };
        execute_with_defaults(state, signal).await;
    }
}

async fn batch_fetch_quotes(state: &Arc<AppState>, symbols: &HashSet<String>) -> HashMap<String, Decimal> {
    if symbols.is_empty() {
        return HashMap::new();
    }
    let symbols: Vec<String> = symbols.iter().cloned().collect();
    match state.quote.get_quotes(&symbols).await {
        Ok(quotes) => quotes.into_iter().map(|(symbol, quote)| (symbol, quote.last_done)).collect(),
        Err(e) => {
            warn!(error = %e, "batch quote fetch failed");
            HashMap::new()
        }
    }
}

async fn run_monitor_pass(
    state: &Arc<AppState>,
    monitor: &crate::config::MonitorConfig,
    quotes: &HashMap<String, Decimal>,
    is_open_protection: bool,
    trading_day_key: &str,
    now: DateTime<Utc>,
) {
    let Some(&monitor_price) = quotes.get(&monitor.monitor_symbol) else { return };

    for direction in [Direction::Long, Direction::Short] {
        state.registry.ensure_seat(&monitor.monitor_symbol, direction);

        maybe_run_auto_symbol(state, monitor, direction, monitor_price, is_open_protection, trading_day_key, now).await;

        let seat = state.registry.get_seat_state(&monitor.monitor_symbol, direction);
        let Some(symbol) = seat.as_ref().and_then(|s| s.symbol.clone()) else { continue };
        let Some(&warrant_price) = quotes.get(&symbol) else { continue };

        let snapshot = refresh_indicator_snapshot(state, &symbol).await;

        let long_price = if direction == Direction::Long { Some(warrant_price) } else { None };
        let short_price = if direction == Direction::Short { Some(warrant_price) } else { None };
        let prices = MonitorPrices { monitor_price, long_price, short_price };
        let seat_version = seat.map(|s| s.seat_version).unwrap_or(0);

        let output = StrategyEngine::evaluate(monitor, prices, &snapshot, seat_version, seat_version, now);
        handle_strategy_output(state, monitor, direction, &symbol, warrant_price, output, now).await;
    }
}

async fn maybe_run_auto_symbol(
    state: &Arc<AppState>,
    monitor: &crate::config::MonitorConfig,
    direction: Direction,
    monitor_price: Decimal,
    is_open_protection: bool,
    trading_day_key: &str,
    now: DateTime<Utc>,
) {
    if !monitor.auto_search_config.enabled {
        return;
    }
    let seat_key = SeatKey { monitor_symbol: monitor.monitor_symbol.clone(), direction };

    state
        .auto_symbol
        .maybe_search_on_tick(&seat_key, monitor, monitor_price, now, is_open_protection, trading_day_key)
        .await;

    let switch_started = state.auto_symbol.maybe_switch_on_distance(&seat_key, monitor, monitor_price, now, trading_day_key);
    if switch_started || state.auto_symbol.has_pending_switch(&seat_key) {
        state.auto_symbol_queue.schedule_latest(Task { dedupe_key: seat_key.to_string(), payload: seat_key });
    }
}

async fn refresh_indicator_snapshot(state: &Arc<AppState>, symbol: &str) -> crate::indicators::IndicatorSnapshot {
    let candles: Vec<Candlestick> = state.quote.get_realtime_candlesticks(symbol, 200).await.unwrap_or_default();
    if !candles.is_empty() {
        state.candle_buffer.update(symbol, candles);
    }

    let fingerprint = state.candle_buffer.fingerprint(symbol);
    let cached = state.caches.indicator_snapshots.read().get(symbol).cloned();
    if let (Some(fp), Some((cached_fp, snapshot))) = (fingerprint, cached.as_ref()) {
        if fp == *cached_fp {
            return snapshot.clone();
        }
    }

    let closed = state.candle_buffer.get_closed(symbol, 200);
    let snapshot = state.indicator_engine.compute(&closed);
    if let Some(fp) = fingerprint {
        state.caches.indicator_snapshots.write().insert(symbol.to_string(), (fp, snapshot.clone()));
    }
    snapshot
}

async fn handle_strategy_output(
    state: &Arc<AppState>,
    monitor: &crate::config::MonitorConfig,
    direction: Direction,
    symbol: &str,
    warrant_price: Decimal,
    output: crate::strategy::StrategyOutput,
    now: DateTime<Utc>,
) {
    let mut immediate = output.immediate_signals;

    // Sell signals need quantity resolution against the FIFO ledger before
    // they reach risk checks or the queue.
    let sell_args = ProcessSellArgs {
        order_recorder: &state.order_recorder,
        trading_calendar: state.calendar.as_ref(),
        smart_close_enabled: monitor.smart_close_enabled,
        smart_close_timeout_minutes: monitor.smart_close_timeout_minutes,
        now,
    };
    immediate = SignalProcessor::process_sell_signals(immediate, symbol, direction.is_long(), sell_args);

    let account = match state.trade.account_balance().await {
        Ok(a) => AccountSnapshot { available_cash: a.available_cash },
        Err(_) => AccountSnapshot { available_cash: Decimal::ZERO },
    };
    let held_quantity = state.order_recorder.available_quantity(symbol, direction.is_long());
    let position_notional = warrant_price * Decimal::from(held_quantity);

    immediate = SignalProcessor::apply_risk_checks(
        immediate,
        &state.risk,
        &account,
        &PositionSnapshot { notional: position_notional },
        monitor.target_notional,
        monitor.max_position_notional,
    );

    for mut signal in immediate {
        if signal.symbol.is_empty() {
            signal.symbol = symbol.to_string();
        }
        enqueue_signal(state, signal);
    }

    for (signal, verify_direction, delay_seconds) in output.delayed_signals {
        let mut signal = signal;
        if signal.symbol.is_empty() {
            signal.symbol = symbol.to_string();
        }
        let groups = if verify_direction.is_long() { &monitor.verification_config.buy.indicators } else { &monitor.verification_config.sell.indicators };
        state.verifier.schedule(signal, verify_direction, delay_seconds, groups.clone(), now);
    }
}

fn enqueue_signal(state: &Arc<AppState>, signal: Signal) {
    let Some(side) = signal.action.side() else { return };
    let key = format!("{}:{}:{}", signal.symbol, side, signal.action);
    match side {
        Side::Buy => state.buy_queue.schedule_latest(Task { dedupe_key: key, payload: signal }),
        Side::Sell => state.sell_queue.schedule_latest(Task { dedupe_key: key, payload: signal }),
    }
}

/// Resolve a warrant symbol back to its owning monitor config, via the
/// symbol registry's seat bindings (the queues carry resolved warrant
/// symbols, not monitor symbols).
fn monitor_for_symbol<'a>(state: &Arc<AppState>, config: &'a crate::config::EngineConfig, symbol: &str) -> Option<&'a crate::config::MonitorConfig> {
    let (seat_key, _) = state.registry.resolve_seat_by_symbol(symbol)?;
    config.monitor(&seat_key.monitor_symbol)
}

async fn execute_with_defaults(state: &Arc<AppState>, signal: Signal) {
    let config = state.config.read().clone();
    let meta = state.caches.symbol_meta.read().clone();
    let target_notional = monitor_for_symbol(state, &config, &signal.symbol).map(|m| m.target_notional).unwrap_or(Decimal::ZERO);

    let outcomes = state
        .executor
        .execute_signals(ExecuteArgs {
            signals: vec![signal],
            symbol_meta: &meta,
            target_notional,
            trading_order_type: config.global.trading_order_type,
            liquidation_order_type: config.global.liquidation_order_type,
            is_trading_enabled: state.lifecycle.is_trading_enabled(),
            execution_gate: state.execution_gate.as_ref(),
            now: Utc::now(),
        })
        .await;
    log_execution_outcomes(state, outcomes);
}

fn log_execution_outcomes(state: &Arc<AppState>, outcomes: Vec<ExecutionOutcome>) {
    for outcome in outcomes {
        match outcome {
            ExecutionOutcome::Submitted(order) => {
                info!(order_id = %order.order_id, symbol = %order.symbol, "signal executed");
            }
            ExecutionOutcome::Skipped { symbol, reason } => {
                debug!(%symbol, %reason, "signal skipped");
            }
            ExecutionOutcome::Failed { symbol, error } => {
                warn!(%symbol, %error, "signal execution failed");
                let monitor_symbol = symbol.clone();
                if let Err(e) = state.trade_log.record_failed("", symbol, monitor_symbol, SignalAction::Hold, "execution failed", error, Utc::now()) {
                    warn!(error = %e, "failed to write FAILED trade log record");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task processors — consume the queues `run_tick` populates. Each is driven
// by its own subscriber loop in `main.rs`; these free functions process one
// task and are unit-testable without a running tokio task.
// ---------------------------------------------------------------------------

pub async fn process_one_buy(state: &Arc<AppState>) -> bool {
    let Some(task) = state.buy_queue.pop() else { return false };
    execute_with_defaults(state, task.payload).await;
    true
}

pub async fn process_one_sell(state: &Arc<AppState>) -> bool {
    let Some(task) = state.sell_queue.pop() else { return false };
    execute_with_defaults(state, task.payload).await;
    true
}

/// Price-chase pass: consume the latest `monitor_queue` task (a symbol ->
/// quote map) and replace/cancel tracked orders whose price has drifted or
/// timed out, spec §4.11 step 8 / §4.5.
pub async fn process_one_monitor_chase(state: &Arc<AppState>) -> bool {
    let Some(task) = state.monitor_queue.pop() else { return false };
    let quotes = task.payload;
    let config = state.config.read().clone();

    let events = state
        .order_monitor
        .process_with_latest_quotes(ChaseArgs {
            quotes: &quotes,
            now: Utc::now(),
            price_decimals: config.global.price_decimals,
            price_update_interval_ms: config.global.order_monitor_price_update_interval_ms,
            buy_timeout: config.global.buy_order_timeout,
            sell_timeout: config.global.sell_order_timeout,
            execution_gate: state.execution_gate.as_ref(),
        })
        .await;

    for event in events {
        log_monitor_event(state, event);
    }
    true
}

pub async fn process_one_auto_symbol(state: &Arc<AppState>) -> bool {
    let Some(task) = state.auto_symbol_queue.pop() else { return false };
    let seat_key = task.payload;
    let config = state.config.read().clone();
    let Some(monitor) = config.monitor(&seat_key.monitor_symbol) else { return true };

    let candidate_symbol = state.registry.get_seat_state(&seat_key.monitor_symbol, seat_key.direction).and_then(|s| s.symbol);
    let quote = if let Some(symbol) = &candidate_symbol {
        state.quote.get_quotes(std::slice::from_ref(symbol)).await.ok().and_then(|q| q.get(symbol).map(|q| q.last_done))
    } else {
        None
    };

    let outcome = state.auto_symbol.drive_switch(&seat_key, monitor, Utc::now(), quote, None).await;
    if matches!(outcome, crate::auto_symbol::SwitchDriveOutcome::InProgress) {
        state.auto_symbol_queue.schedule_latest(Task { dedupe_key: seat_key.to_string(), payload: seat_key });
    }
    true
}

pub async fn process_one_post_trade_refresh(state: &Arc<AppState>) -> bool {
    let Some(task) = state.post_trade_refresh_queue.pop() else { return false };
    let symbol = task.payload;
    if let Ok(candles) = state.quote.get_realtime_candlesticks(&symbol, 200).await {
        if !candles.is_empty() {
            state.candle_buffer.update(&symbol, candles);
        }
    }
    true
}

/// Verifier poll pass: promote or drop delayed signals whose verification
/// window has elapsed, spec §4.9. Promoted signals re-enter the same
/// enqueue path as immediate signals.
pub async fn poll_verifier(state: &Arc<AppState>, now: DateTime<Utc>) {
    let snapshots: HashMap<String, crate::indicators::IndicatorSnapshot> =
        state.caches.indicator_snapshots.read().iter().map(|(k, (_, v))| (k.clone(), v.clone())).collect();
    let outcomes = state.verifier.poll_due(now, &snapshots);
    for outcome in outcomes {
        match outcome {
            VerificationOutcome::Promoted(signal) => enqueue_signal(state, signal),
            VerificationOutcome::Dropped { symbol, reason } => debug!(%symbol, %reason, "delayed signal dropped at verification"),
        }
    }
}

/// Route a broker push event to the order monitor and log whatever it
/// reports back.
pub async fn handle_push_event(state: &Arc<AppState>, event: OrderChanged) {
    let monitor_events = state.order_monitor.on_order_changed(event);
    for monitor_event in monitor_events {
        log_monitor_event(state, monitor_event);
    }
}

fn log_monitor_event(state: &Arc<AppState>, event: MonitorEvent) {
    match event {
        MonitorEvent::Filled { order, executed_price, executed_quantity } => {
            info!(order_id = %order.order_id, symbol = %order.symbol, ?executed_price, executed_quantity, "order filled");
            let record = TradeLogRecord {
                order_id: order.order_id,
                symbol: order.symbol.clone(),
                monitor_symbol: order.monitor_symbol,
                action: if order.side == Side::Buy {
                    if order.is_long_symbol { SignalAction::BuyCall } else { SignalAction::BuyPut }
                } else if order.is_long_symbol {
                    SignalAction::SellCall
                } else {
                    SignalAction::SellPut
                },
                side: order.side,
                quantity: executed_quantity,
                price: executed_price.unwrap_or_default(),
                order_type: order.order_type,
                status: TradeLogStatus::Filled,
                reason: "order monitor fill".to_string(),
                signal_trigger_time: order.submitted_at,
                executed_at: Some(Utc::now()),
                timestamp: Utc::now(),
                is_protective_clearance: order.is_protective_liquidation,
                error: None,
            };
            if let Err(e) = state.trade_log.append(record) {
                warn!(error = %e, "failed to append fill to trade log");
            }
        }
        MonitorEvent::Canceled { order } => info!(order_id = %order.order_id, "order cancelled"),
        MonitorEvent::Rejected { order } => warn!(order_id = %order.order_id, "order rejected"),
        MonitorEvent::ReplacedPrice { order_id, new_price } => debug!(%order_id, %new_price, "order price chased"),
        MonitorEvent::ConvertedToMarket { old_order_id, new_order } => {
            info!(%old_order_id, new_order_id = %new_order.order_id, "sell converted to market at timeout")
        }
        MonitorEvent::CancelFailed { order_id, error } => warn!(%order_id, %error, "cancel failed"),
        MonitorEvent::ReplaceFailed { order_id, error } => warn!(%order_id, %error, "replace failed"),
    }
}
