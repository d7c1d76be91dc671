// =============================================================================
// Trade log — persisted state, spec §6
// =============================================================================
//
// One JSON array file per trading day under `logs/trades/YYYY-MM-DD.json`.
// Each append rewrites the day's file through the same tmp+rename pattern
// `EngineConfig::save` uses, so a crash mid-write never corrupts a day's
// records — the distilled spec only says these files get written; the
// crash-safety comes from following the config writer's own idiom rather
// than a plain `OpenOptions::append`.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{OrderType, Side, SignalAction, TradeLogStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogRecord {
    pub order_id: String,
    pub symbol: String,
    pub monitor_symbol: String,
    pub action: SignalAction,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub order_type: OrderType,
    pub status: TradeLogStatus,
    pub reason: String,
    pub signal_trigger_time: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub is_protective_clearance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Appends trade records to one JSON-array file per day. A single process-wide
/// lock serialises appends; daily volume is low enough that a full
/// read-modify-write per append is cheap and keeps the write atomic.
pub struct TradeLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl TradeLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), lock: Mutex::new(()) }
    }

    fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{day}.json"))
    }

    /// Append `record`, filed under the day named by its own `timestamp`.
    pub fn append(&self, record: TradeLogRecord) -> Result<()> {
        let _guard = self.lock.lock();
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create trade log dir {}", self.dir.display()))?;

        let path = self.path_for(record.timestamp.date_naive());

        let mut records: Vec<TradeLogRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read trade log {}", path.display()))?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            Vec::new()
        };
        records.push(record);

        let content = serde_json::to_string_pretty(&records).context("failed to serialise trade log")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp trade log {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp trade log to {}", path.display()))?;

        info!(path = %path.display(), "trade log record appended");
        Ok(())
    }

    /// Convenience constructor for a FAILED record, spec §7 "logical
    /// precondition fail ... trade log emits FAILED".
    pub fn record_failed(
        &self,
        order_id: impl Into<String>,
        symbol: impl Into<String>,
        monitor_symbol: impl Into<String>,
        action: SignalAction,
        reason: impl Into<String>,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.append(TradeLogRecord {
            order_id: order_id.into(),
            symbol: symbol.into(),
            monitor_symbol: monitor_symbol.into(),
            action,
            side: action.side().unwrap_or(Side::Buy),
            quantity: 0,
            price: Decimal::ZERO,
            order_type: OrderType::Mo,
            status: TradeLogStatus::Failed,
            reason: reason.into(),
            signal_trigger_time: now,
            executed_at: None,
            timestamp: now,
            is_protective_clearance: false,
            error: Some(error.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(ts: DateTime<Utc>, order_id: &str) -> TradeLogRecord {
        TradeLogRecord {
            order_id: order_id.to_string(),
            symbol: "12345.HK".into(),
            monitor_symbol: "HSI".into(),
            action: SignalAction::BuyCall,
            side: Side::Buy,
            quantity: 100,
            price: Decimal::new(105, 2),
            order_type: OrderType::Elo,
            status: TradeLogStatus::Submitted,
            reason: "condition_groups matched".into(),
            signal_trigger_time: ts,
            executed_at: None,
            timestamp: ts,
            is_protective_clearance: false,
            error: None,
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("warrant-nexus-test-{tag}-{}", std::process::id()))
    }

    #[test]
    fn append_grows_the_days_file() {
        let dir = temp_dir("append");
        let log = TradeLog::new(dir.clone());
        let ts = Utc.with_ymd_and_hms(2026, 7, 28, 9, 31, 0).unwrap();

        log.append(sample(ts, "O1")).unwrap();
        log.append(sample(ts, "O2")).unwrap();

        let content = std::fs::read_to_string(log.path_for(ts.date_naive())).unwrap();
        let records: Vec<TradeLogRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].order_id, "O2");

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn record_failed_writes_a_failed_status_entry() {
        let dir = temp_dir("failed");
        let log = TradeLog::new(dir.clone());
        let ts = Utc.with_ymd_and_hms(2026, 7, 28, 9, 31, 0).unwrap();

        log.record_failed("O3", "12345.HK", "HSI", SignalAction::BuyCall, "insufficient cash", "denied", ts).unwrap();

        let content = std::fs::read_to_string(log.path_for(ts.date_naive())).unwrap();
        let records: Vec<TradeLogRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records[0].status, TradeLogStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("denied"));

        std::fs::remove_dir_all(dir).ok();
    }
}
