// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine.  Every public function returns `Option<T>` so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.

pub mod ema;
pub mod kdj;
pub mod macd;
pub mod mfi;
pub mod psy;
pub mod rsi;

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;

use crate::broker::Candlestick;

/// A named snapshot of indicator values for one monitor at one tick, the
/// shape `evaluate_condition_groups` (spec §6) reads `condition.indicator`
/// out of. Kept as a flat `HashMap<String, f64>` rather than a struct with
/// one field per indicator so that `signal_config` can name arbitrary
/// indicator keys (e.g. `rsi_14`, `kdj_j`, `macd_hist`) without this crate
/// knowing every strategy's vocabulary ahead of time.
pub type IndicatorSnapshot = HashMap<String, f64>;

/// External collaborator (spec §1: "indicator-math primitives ... out of
/// scope"): computes an `IndicatorSnapshot` from closed candles. The engine
/// depends only on this trait: the default implementation below is the
/// concrete instance this crate ships, built from the kept/added pure
/// indicator functions, but a production deployment could swap in a richer
/// one without touching the strategy or signal processor.
pub trait IndicatorEngine: Send + Sync {
    fn compute(&self, candles: &[Candlestick]) -> IndicatorSnapshot;
}

/// Default `IndicatorEngine`: EMA/RSI/KDJ/MACD/MFI/PSY over closing (and, for
/// MFI, full OHLCV) data, each keyed by its conventional name.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIndicatorEngine;

impl IndicatorEngine for DefaultIndicatorEngine {
    fn compute(&self, candles: &[Candlestick]) -> IndicatorSnapshot {
        let closes: Vec<f64> = candles.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high.to_f64().unwrap_or(0.0)).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low.to_f64().unwrap_or(0.0)).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume as f64).collect();

        let mut snapshot = IndicatorSnapshot::new();

        if let Some(&rsi14) = rsi::calculate_rsi(&closes, 14).last() {
            snapshot.insert("rsi_14".to_string(), rsi14);
        }
        if let Some(&ema9) = ema::calculate_ema(&closes, 9).last() {
            snapshot.insert("ema_9".to_string(), ema9);
        }
        if let Some(&ema21) = ema::calculate_ema(&closes, 21).last() {
            snapshot.insert("ema_21".to_string(), ema21);
        }
        if let Some(kdj) = kdj::calculate_kdj(&highs, &lows, &closes, 9).last() {
            snapshot.insert("kdj_k".to_string(), kdj.k);
            snapshot.insert("kdj_d".to_string(), kdj.d);
            snapshot.insert("kdj_j".to_string(), kdj.j);
        }
        if let Some(m) = macd::calculate_macd(&closes, 12, 26, 9).last() {
            snapshot.insert("macd".to_string(), m.macd);
            snapshot.insert("macd_signal".to_string(), m.signal);
            snapshot.insert("macd_hist".to_string(), m.histogram);
        }
        if let Some(&mfi14) = mfi::calculate_mfi(&highs, &lows, &closes, &volumes, 14).last() {
            snapshot.insert("mfi_14".to_string(), mfi14);
        }
        if let Some(&psy12) = psy::calculate_psy(&closes, 12).last() {
            snapshot.insert("psy_12".to_string(), psy12);
        }

        snapshot
    }
}
