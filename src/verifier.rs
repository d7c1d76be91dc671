// =============================================================================
// Delayed signal verifier — spec §4.9 (C9)
// =============================================================================
//
// Schedules a re-check of a signal `delay_seconds` after it was first
// raised; when the delay elapses, re-evaluates the verification condition
// groups against the *current* indicator snapshot and either promotes the
// signal (caller enqueues it as an immediate buy/sell task) or drops it.
// Built on the reference engine's `RwLock<HashMap<...>>`-owned-state idiom
// rather than a dedicated timer-wheel crate: the number of outstanding
// delayed signals is always small (at most one per (symbol, direction)), so
// a per-tick scan for expired entries is simpler than the priority-queue
// alternative spec §9 mentions and avoids a new dependency.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::ConditionGroup;
use crate::indicators::IndicatorSnapshot;
use crate::types::{Direction, Signal};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScheduleKey {
    symbol: String,
    direction: Direction,
}

struct Scheduled {
    signal: Signal,
    verify_at: DateTime<Utc>,
    verification_groups: Vec<ConditionGroup>,
}

/// Outcome of a verification pass, returned to the caller for logging and
/// enqueueing.
pub enum VerificationOutcome {
    Promoted(Signal),
    Dropped { symbol: String, reason: String },
}

/// Holds scheduled delayed-signal re-checks keyed by (symbol, direction),
/// spec §4.9. At most one outstanding schedule per key: scheduling a new
/// one for the same key replaces the old (mirrors the at-most-once
/// promotion guarantee — an overwritten schedule can never later fire).
pub struct DelayedSignalVerifier {
    scheduled: RwLock<HashMap<ScheduleKey, Scheduled>>,
}

impl DelayedSignalVerifier {
    pub fn new() -> Self {
        Self { scheduled: RwLock::new(HashMap::new()) }
    }

    /// Schedule `signal` for re-verification at `now + delay_seconds`
    /// against `verification_groups`.
    pub fn schedule(
        &self,
        signal: Signal,
        direction: Direction,
        delay_seconds: u64,
        verification_groups: Vec<ConditionGroup>,
        now: DateTime<Utc>,
    ) {
        let key = ScheduleKey { symbol: signal.symbol.clone(), direction };
        let verify_at = now + chrono::Duration::seconds(delay_seconds as i64);
        debug!(symbol = %key.symbol, %direction, verify_at = %verify_at, "delayed signal scheduled");
        self.scheduled.write().insert(key, Scheduled { signal, verify_at, verification_groups });
    }

    /// Cancel the scheduled signal for (symbol, direction), if any. Returns
    /// whether one was cancelled.
    pub fn cancel(&self, symbol: &str, direction: Direction) -> bool {
        self.scheduled
            .write()
            .remove(&ScheduleKey { symbol: symbol.to_string(), direction })
            .is_some()
    }

    /// Cancel every scheduled signal for `symbol`, across both directions.
    pub fn cancel_symbol(&self, symbol: &str) -> usize {
        let mut scheduled = self.scheduled.write();
        let before = scheduled.len();
        scheduled.retain(|key, _| key.symbol != symbol);
        before - scheduled.len()
    }

    /// Cancel every scheduled signal, used on session exit (spec §4.11 step
    /// 2: leaving the trading session cancels all delayed signals).
    pub fn cancel_all(&self) -> usize {
        let mut scheduled = self.scheduled.write();
        let n = scheduled.len();
        scheduled.clear();
        n
    }

    pub fn pending_count(&self) -> usize {
        self.scheduled.read().len()
    }

    /// Pop and verify every schedule whose `verify_at` has elapsed as of
    /// `now`, using `current_snapshots` to look up the live indicator
    /// snapshot for each signal's symbol. Guarantees at-most-once promotion:
    /// an entry is removed from `scheduled` before being evaluated, so it
    /// cannot fire twice even if called reentrantly.
    pub fn poll_due(
        &self,
        now: DateTime<Utc>,
        current_snapshots: &HashMap<String, IndicatorSnapshot>,
    ) -> Vec<VerificationOutcome> {
        let due_keys: Vec<ScheduleKey> = {
            let scheduled = self.scheduled.read();
            scheduled
                .iter()
                .filter(|(_, s)| s.verify_at <= now)
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut outcomes = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            let Some(entry) = self.scheduled.write().remove(&key) else {
                continue; // already consumed by a concurrent poll
            };
            let snapshot = current_snapshots.get(&key.symbol);
            let passed = snapshot
                .map(|snap| crate::config::evaluate_condition_groups(&entry.verification_groups, snap))
                .unwrap_or(false);

            if passed {
                let mut signal = entry.signal;
                signal.verification_history.push(crate::types::VerificationRecord {
                    checked_at: now,
                    passed: true,
                });
                outcomes.push(VerificationOutcome::Promoted(signal));
            } else {
                outcomes.push(VerificationOutcome::Dropped {
                    symbol: key.symbol,
                    reason: "delayed verification condition not met".to_string(),
                });
            }
        }
        outcomes
    }
}

impl Default for DelayedSignalVerifier {
    fn default() -> Self {
        Self::new()
    }
}
