// =============================================================================
// Engine configuration — hot-reloadable, environment + JSON file
// =============================================================================
//
// Every tunable parameter named in spec §6 lives here. Persistence follows
// the reference engine's atomic tmp+rename pattern (`RuntimeConfig::save`) so
// a crash mid-write never corrupts the config file. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Direction, LiquidationCooldown, OrderType};

// ---------------------------------------------------------------------------
// Signal condition groups
// ---------------------------------------------------------------------------

/// Comparison operator for a single indicator condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl CompareOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Lte => lhs <= rhs,
            CompareOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
        }
    }
}

/// A single condition: `indicators[name] <op> value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub indicator: String,
    pub op: CompareOp,
    pub value: f64,
}

/// A condition group: every condition must hold (AND). A signal's
/// `condition_groups` is a list of groups; any group satisfied (OR) triggers
/// the action, the same OR-of-AND shape the original Longbridge-derived
/// system and the reference engine's own signal inputs both use implicitly.
pub type ConditionGroup = Vec<Condition>;

/// Evaluate `groups` against a named indicator snapshot: OR across groups,
/// AND within each group. An empty group list never triggers.
pub fn evaluate_condition_groups(groups: &[ConditionGroup], snapshot: &HashMap<String, f64>) -> bool {
    groups.iter().any(|group| {
        !group.is_empty()
            && group.iter().all(|cond| {
                snapshot
                    .get(&cond.indicator)
                    .map(|&v| cond.op.apply(v, cond.value))
                    .unwrap_or(false)
            })
    })
}

/// Per-action condition groups for one monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub buycall: Vec<ConditionGroup>,
    #[serde(default)]
    pub sellcall: Vec<ConditionGroup>,
    #[serde(default)]
    pub buyput: Vec<ConditionGroup>,
    #[serde(default)]
    pub sellput: Vec<ConditionGroup>,
}

/// Verification settings for one side (buy or sell) of the delayed-signal
/// pipeline: wait `delay_seconds`, then re-check against `indicators`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSide {
    #[serde(default = "default_verification_delay")]
    pub delay_seconds: u64,
    #[serde(default)]
    pub indicators: Vec<ConditionGroup>,
}

fn default_verification_delay() -> u64 {
    30
}

impl Default for VerificationSide {
    fn default() -> Self {
        Self {
            delay_seconds: default_verification_delay(),
            indicators: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub buy: VerificationSide,
    #[serde(default)]
    pub sell: VerificationSide,
}

// ---------------------------------------------------------------------------
// Auto-search / auto-switch configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSearchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_expiry_min_months")]
    pub expiry_min_months: u32,
    #[serde(default = "default_open_delay_minutes")]
    pub open_delay_minutes: u32,
    #[serde(default = "default_min_distance_pct")]
    pub min_distance_pct_bull: f64,
    #[serde(default = "default_min_distance_pct")]
    pub min_distance_pct_bear: f64,
    #[serde(default)]
    pub min_turnover_per_minute_bull: f64,
    #[serde(default)]
    pub min_turnover_per_minute_bear: f64,
    /// Acceptable strike-distance band for the bull (LONG) seat before an
    /// auto-switch is triggered: `(min_pct, max_pct)`.
    #[serde(default = "default_switch_range")]
    pub switch_distance_range_bull: (f64, f64),
    #[serde(default = "default_switch_range")]
    pub switch_distance_range_bear: (f64, f64),
    /// Maximum search failures per trading day before the seat freezes for
    /// the rest of the day.
    #[serde(default = "default_max_search_failures")]
    pub max_search_failures_per_day: u32,
}

fn default_expiry_min_months() -> u32 {
    3
}
fn default_open_delay_minutes() -> u32 {
    5
}
fn default_min_distance_pct() -> f64 {
    3.0
}
fn default_switch_range() -> (f64, f64) {
    (3.0, 20.0)
}
fn default_max_search_failures() -> u32 {
    5
}

impl Default for AutoSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expiry_min_months: default_expiry_min_months(),
            open_delay_minutes: default_open_delay_minutes(),
            min_distance_pct_bull: default_min_distance_pct(),
            min_distance_pct_bear: default_min_distance_pct(),
            min_turnover_per_minute_bull: 0.0,
            min_turnover_per_minute_bear: 0.0,
            switch_distance_range_bull: default_switch_range(),
            switch_distance_range_bear: default_switch_range(),
            max_search_failures_per_day: default_max_search_failures(),
        }
    }
}

// ---------------------------------------------------------------------------
// Order ownership mapping (used by recovery to resolve (monitor, direction)
// from a traded warrant symbol)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipEntry {
    pub monitor_symbol: String,
    pub direction: Direction,
}

pub type OrderOwnershipMapping = HashMap<String, OwnershipEntry>;

// ---------------------------------------------------------------------------
// Per-monitor configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub monitor_symbol: String,
    #[serde(default)]
    pub long_symbol: Option<String>,
    #[serde(default)]
    pub short_symbol: Option<String>,
    pub target_notional: Decimal,
    pub max_position_notional: Decimal,
    pub max_daily_loss: Decimal,
    pub max_unrealized_loss_per_symbol: Decimal,
    #[serde(default = "default_buy_interval_seconds")]
    pub buy_interval_seconds: u64,
    #[serde(default = "default_liquidation_cooldown")]
    pub liquidation_cooldown: LiquidationCooldown,
    #[serde(default)]
    pub smart_close_enabled: bool,
    #[serde(default)]
    pub smart_close_timeout_minutes: Option<u32>,
    #[serde(default)]
    pub auto_search_config: AutoSearchConfig,
    #[serde(default)]
    pub verification_config: VerificationConfig,
    #[serde(default)]
    pub signal_config: SignalConfig,
    #[serde(default)]
    pub order_ownership_mapping: OrderOwnershipMapping,
}

fn default_buy_interval_seconds() -> u64 {
    60
}
fn default_liquidation_cooldown() -> LiquidationCooldown {
    LiquidationCooldown::Minutes(30)
}

// ---------------------------------------------------------------------------
// Global configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenProtectionWindow {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_open_protection_minutes")]
    pub minutes: u32,
}

fn default_open_protection_minutes() -> u32 {
    5
}

impl Default for OpenProtectionWindow {
    fn default() -> Self {
        Self {
            enabled: true,
            minutes: default_open_protection_minutes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenProtectionConfig {
    #[serde(default)]
    pub morning: OpenProtectionWindow,
    #[serde(default)]
    pub afternoon: OpenProtectionWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTimeoutConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    20
}

impl Default for OrderTimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_price_update_interval_ms() -> u64 {
    3000
}
fn default_rebuild_retry_delay_ms() -> u64 {
    30_000
}
fn default_decimals() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_true")]
    pub doomsday_protection: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub open_protection: OpenProtectionConfig,
    #[serde(default = "default_price_update_interval_ms")]
    pub order_monitor_price_update_interval_ms: u64,
    #[serde(default = "default_rebuild_retry_delay_ms")]
    pub rebuild_retry_delay_ms: u64,
    #[serde(default)]
    pub trading_order_type: OrderType,
    #[serde(default)]
    pub liquidation_order_type: OrderType,
    #[serde(default)]
    pub buy_order_timeout: OrderTimeoutConfig,
    #[serde(default)]
    pub sell_order_timeout: OrderTimeoutConfig,
    /// Decimal places used to normalize every outbound price (spec §9 Design
    /// Notes: fixed-decimal payload normalization).
    #[serde(default = "default_decimals")]
    pub price_decimals: u32,
    /// Rate-limiter parameters, spec §4.1.
    #[serde(default = "default_rate_limit_max_calls")]
    pub rate_limit_max_calls: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
}

fn default_rate_limit_max_calls() -> u32 {
    10
}
fn default_rate_limit_window_ms() -> u64 {
    1000
}

impl Default for OrderType {
    fn default() -> Self {
        OrderType::Elo
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            doomsday_protection: true,
            debug: false,
            open_protection: OpenProtectionConfig::default(),
            order_monitor_price_update_interval_ms: default_price_update_interval_ms(),
            rebuild_retry_delay_ms: default_rebuild_retry_delay_ms(),
            trading_order_type: OrderType::Elo,
            liquidation_order_type: OrderType::Mo,
            buy_order_timeout: OrderTimeoutConfig::default(),
            sell_order_timeout: OrderTimeoutConfig::default(),
            price_decimals: default_decimals(),
            rate_limit_max_calls: default_rate_limit_max_calls(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level engine configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            monitors: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            monitors = config.monitors.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist configuration using an atomic write (write to `.tmp`, rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    pub fn monitor(&self, symbol: &str) -> Option<&MonitorConfig> {
        self.monitors.iter().find(|m| m.monitor_symbol == symbol)
    }
}
