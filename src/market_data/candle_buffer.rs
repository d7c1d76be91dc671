// =============================================================================
// Candle buffer — per-monitor closed-candle ring + fingerprint
// =============================================================================
//
// Adapted from the reference engine's `CandleBuffer` (a `RwLock<HashMap<Key,
// VecDeque<Candle>>>` ring keyed by symbol/interval). The reference engine
// fed this from a Binance kline WebSocket; this engine's quote context only
// exposes a pull API (`get_realtime_candlesticks`/`subscribe_candlesticks`,
// spec §6), so the per-tick orchestrator pulls candles and pushes them in
// here instead of a dedicated WS reader task. What's kept is the ring-buffer
// idiom and trimming behavior; what's new is `fingerprint`, which spec
// §4.11 step 6 needs to decide whether to skip indicator recomputation for
// an unchanged candle.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;

use crate::broker::Candlestick;

/// A cheap identity for "has the most recent candle changed since last
/// tick" — the close timestamp plus the close price. Two fingerprints equal
/// implies the same closed candle was observed, so the orchestrator can
/// reuse the last indicator snapshot (spec §4.11 step 6) instead of
/// recomputing every indicator on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandleFingerprint {
    timestamp_millis: i64,
    close_scaled: i64,
}

/// Thread-safe ring buffer of recent closed candles per monitor symbol.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<String, VecDeque<Candlestick>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Replace the stored series for `symbol` with a freshly pulled batch of
    /// closed candles (oldest-first), trimming to `max_candles`. Broker
    /// candle pulls return the whole recent window each time (spec §6
    /// `get_realtime_candlesticks`), so this is a replace, not an append.
    pub fn update(&self, symbol: &str, mut candles: Vec<Candlestick>) {
        candles.sort_by_key(|c| c.timestamp);
        if candles.len() > self.max_candles {
            let drop = candles.len() - self.max_candles;
            candles.drain(0..drop);
        }
        self.buffers
            .write()
            .insert(symbol.to_string(), candles.into());
    }

    pub fn get_closed(&self, symbol: &str, count: usize) -> Vec<Candlestick> {
        let map = self.buffers.read();
        match map.get(symbol) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn count(&self, symbol: &str) -> usize {
        self.buffers.read().get(symbol).map_or(0, VecDeque::len)
    }

    /// Fingerprint of the most recent candle, or `None` if the buffer is
    /// empty. Price is compared at 4 decimal-scaled integer precision so
    /// binary-float jitter from the broker's decimal-to-f64 conversion never
    /// produces a spurious fingerprint change.
    pub fn fingerprint(&self, symbol: &str) -> Option<CandleFingerprint> {
        let map = self.buffers.read();
        let last = map.get(symbol)?.back()?;
        Some(CandleFingerprint {
            timestamp_millis: last.timestamp.timestamp_millis(),
            close_scaled: (last.close * rust_decimal::Decimal::new(10_000, 0))
                .trunc()
                .to_i64()
                .unwrap_or(0),
        })
    }
}
