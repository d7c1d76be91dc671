// =============================================================================
// Warrant Nexus — Main Entry Point
// =============================================================================
//
// Boots the control plane: load config, build (or mock) the broker adapter,
// wait for the configured runtime gate, run strict startup recovery, then
// spawn the tick loop, the push handler, and the task processors alongside
// each other. Grounded on the reference engine's `main.rs` composition
// (env/config load -> AppState::new -> spawn per-subsystem loops -> wait on
// Ctrl+C), generalized from its fixed market-data/strategy/exit loops to
// this engine's tick + queue-processor shape. The subsystems themselves live
// in the `warrant_nexus` library crate (`src/lib.rs`) so the scenario tests
// under `tests/` can drive them without going through `main()`.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warrant_nexus::app_state::AppState;
use warrant_nexus::broker::{live::LiveBroker, mock::MockBroker, OrderChanged, QuoteContext, TradeContext};
use warrant_nexus::config::{EngineConfig, OrderOwnershipMapping, OwnershipEntry};
use warrant_nexus::order_monitor::RecoverArgs;
use warrant_nexus::types::GateMode;
use warrant_nexus::{calendar, orchestrator, types};

/// Spawn a subscriber-driven processor loop for one of the dedup-latest task
/// queues (spec §4.10): wait on the queue's notify handle, drain everything
/// currently queued, then go back to waiting. Each `orchestrator::process_one_*`
/// reports `false` when its queue was empty so the loop knows to go back to
/// waiting rather than spin. A macro rather than a generic higher-order
/// function since each queue carries a distinct payload type.
macro_rules! spawn_queue_processor {
    ($state:expr, $queue:ident, $process_one:ident) => {{
        let state = $state.clone();
        tokio::spawn(async move {
            let (notify, _sub) = state.$queue.subscribe();
            loop {
                while orchestrator::$process_one(&state).await {}
                notify.notified().await;
            }
        });
    }};
}

/// `AURORA_GATE_MODE` selects the runtime gate, spec §6 CLI: `strict` waits
/// for a live trading session before recovery runs; `skip` proceeds
/// immediately (dev mode). Defaults to `strict` when unset or unparseable.
fn gate_mode_from_env() -> GateMode {
    std::env::var("AURORA_GATE_MODE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(GateMode::Strict)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("warrant-nexus starting up");

    let config_path = std::env::var("AURORA_CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    let gate_mode = gate_mode_from_env();
    info!(?gate_mode, "runtime gate mode resolved");

    let (quote, trade): (Arc<dyn QuoteContext>, Arc<dyn TradeContext>) = build_broker();

    let trade_log_dir = std::env::var("AURORA_TRADE_LOG_DIR").unwrap_or_else(|_| "logs/trades".to_string());
    let state = AppState::new(config, quote, trade, trade_log_dir);

    wait_for_gate(&state, gate_mode).await;

    if let Err(e) = run_startup_recovery(&state).await {
        error!(error = %e, "startup recovery failed, aborting");
        std::process::exit(1);
    }
    info!("startup recovery complete, order monitor is ACTIVE");

    spawn_push_handler(&state);
    spawn_tick_loop(&state);
    spawn_queue_processor!(state, buy_queue, process_one_buy);
    spawn_queue_processor!(state, sell_queue, process_one_sell);
    spawn_queue_processor!(state, monitor_queue, process_one_monitor_chase);
    spawn_queue_processor!(state, auto_symbol_queue, process_one_auto_symbol);
    spawn_queue_processor!(state, post_trade_refresh_queue, process_one_post_trade_refresh);
    spawn_verifier_loop(&state);

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, cancelling delayed signals");

    let cancelled = state.verifier.cancel_all();
    info!(cancelled, "delayed signals cancelled on shutdown");

    if let Err(e) = state.config.read().save(&config_path) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("warrant-nexus shut down complete");
    Ok(())
}

/// `AURORA_BROKER_BASE_URL` + `AURORA_BROKER_TOKEN` select the live HTTP/WS
/// broker; absent either, fall back to the in-memory mock so the engine
/// still boots (and is exercisable) without broker credentials configured.
fn build_broker() -> (Arc<dyn QuoteContext>, Arc<dyn TradeContext>) {
    match (std::env::var("AURORA_BROKER_BASE_URL"), std::env::var("AURORA_BROKER_TOKEN")) {
        (Ok(base_url), Ok(token)) => {
            info!(base_url = %base_url, "using live broker adapter");
            let broker = Arc::new(LiveBroker::new(base_url, token));
            broker.spawn_push_loop();
            (broker.clone(), broker)
        }
        _ => {
            warn!("AURORA_BROKER_BASE_URL/AURORA_BROKER_TOKEN not set, using in-memory mock broker");
            let broker = Arc::new(MockBroker::new());
            (broker.clone(), broker)
        }
    }
}

async fn wait_for_gate(state: &Arc<AppState>, mode: GateMode) {
    if mode == GateMode::Skip {
        info!("gate mode=skip, proceeding immediately without waiting for session");
        return;
    }

    info!("gate mode=strict, waiting for a live HK trading session");
    loop {
        let now = Utc::now();
        let date = now.date_naive();
        let is_tradeable = state.calendar.is_trading_day(date);
        let is_half_day = state.calendar.is_half_day(date);
        if is_tradeable && calendar::is_continuous_hk_session(now, is_half_day) {
            info!("trading session detected, proceeding to startup recovery");
            return;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Merge every monitor's `order_ownership_mapping` into one lookup, since
/// recovery resolves ownership without knowing which monitor a broker
/// snapshot order belongs to ahead of time (spec §4.5 "Resolve ownership
/// via the per-monitor order-name mapping").
fn merged_ownership_mapping(config: &EngineConfig) -> OrderOwnershipMapping {
    let mut merged: OrderOwnershipMapping = OrderOwnershipMapping::new();
    for monitor in &config.monitors {
        for (symbol, entry) in &monitor.order_ownership_mapping {
            merged.insert(
                symbol.clone(),
                OwnershipEntry { monitor_symbol: entry.monitor_symbol.clone(), direction: entry.direction },
            );
        }
        // A seat's currently bound symbol always resolves to its own
        // (monitor, direction) even if the config's explicit mapping table
        // omits it — the common case where ownership is implicit in the
        // seat binding rather than hand-maintained.
        if let Some(symbol) = &monitor.long_symbol {
            merged.entry(symbol.clone()).or_insert(OwnershipEntry {
                monitor_symbol: monitor.monitor_symbol.clone(),
                direction: types::Direction::Long,
            });
        }
        if let Some(symbol) = &monitor.short_symbol {
            merged.entry(symbol.clone()).or_insert(OwnershipEntry {
                monitor_symbol: monitor.monitor_symbol.clone(),
                direction: types::Direction::Short,
            });
        }
    }
    merged
}

/// Strict startup recovery, spec §4.5 / §8 S4: fetch today's open orders
/// from the broker and rebuild tracked-order state from them. Any fail-fast
/// `EngineError` here must abort startup rather than enter ACTIVE on
/// inconsistent state.
async fn run_startup_recovery(state: &Arc<AppState>) -> anyhow::Result<()> {
    let open_orders = state.trade.today_orders(None).await?;
    let config = state.config.read().clone();
    let mapping = merged_ownership_mapping(&config);

    for monitor in &config.monitors {
        state.registry.ensure_seat(&monitor.monitor_symbol, types::Direction::Long);
        state.registry.ensure_seat(&monitor.monitor_symbol, types::Direction::Short);
    }

    state
        .order_monitor
        .recover_order_tracking_from_snapshot(RecoverArgs {
            open_orders,
            order_ownership_mapping: &mapping,
            registry: &state.registry,
            now: Utc::now(),
        })
        .await?;

    Ok(())
}

fn spawn_push_handler(state: &Arc<AppState>) {
    let mut rx = state.trade.subscribe_order_changed();
    let state = state.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_push(&state, event).await;
        }
        warn!("push handler channel closed, no more broker pushes will be processed");
    });
}

async fn handle_push(state: &Arc<AppState>, event: OrderChanged) {
    orchestrator::handle_push_event(state, event).await;
}

/// One tick every second, the orchestrator's own pace for quote-driven
/// recompute; the order-monitor price-chase pass and indicator recompute
/// are both cheap enough to run at this cadence without extra throttling
/// beyond the rate limiter the broker calls already go through.
fn spawn_tick_loop(state: &Arc<AppState>) {
    let state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let outcome = orchestrator::run_tick(&state, Utc::now()).await;
            if !matches!(outcome, orchestrator::TickOutcome::Completed) {
                tracing::debug!(?outcome, "tick ended early");
            }
        }
    });
}

/// Poll the delayed-signal verifier once a second; independent of the main
/// tick cadence because promotions must fire as soon as their delay
/// elapses, not only when a monitor happens to recompute (spec §4.9).
fn spawn_verifier_loop(state: &Arc<AppState>) {
    let state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            orchestrator::poll_verifier(&state, Utc::now()).await;
        }
    });
}
