// =============================================================================
// Day lifecycle manager — spec §4.12 (C12)
// =============================================================================
//
// Drives the daily clear/rebuild cycle across an ordered list of cache
// "domains" (registries, recorders, indicator caches, ...): clear them in
// registration order at midnight, rebuild them in reverse order once the next
// tradeable day opens. Grounded on the reference engine's
// `ServiceRegistry::shutdown`/`start` pair, which already walks its component
// list forward to stop and backward to start for the same dependency reason
// spec §4.12 gives: "dependents built last at init come up first after
// clear, so their inputs are available when downstream domains rebuild."
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::errors::EngineError;
use crate::types::LifecycleState;

/// One cache domain participating in the daily clear/rebuild cycle. Each
/// domain owns its own teardown/rebuild logic; the lifecycle manager only
/// sequences the calls and tracks retry timing.
#[async_trait::async_trait]
pub trait LifecycleDomain: Send + Sync {
    fn name(&self) -> &str;
    async fn midnight_clear(&self) -> Result<(), EngineError>;
    async fn open_rebuild(&self) -> Result<(), EngineError>;
}

/// A minimal day key, e.g. `"2026-07-28"` — matches the `trading_day_key`
/// string keys used on `Seat`/config elsewhere (spec §3), so comparisons
/// never need a calendar lookup of their own.
pub type DayKey = String;

#[derive(Debug, Clone)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub current_day_key: Option<DayKey>,
    pub pending_open_rebuild: bool,
    pub is_trading_enabled: bool,
}

struct Inner {
    state: LifecycleState,
    current_day_key: Option<DayKey>,
    pending_open_rebuild: bool,
    is_trading_enabled: bool,
    next_retry_at: Option<DateTime<Utc>>,
}

/// Tracks (lifecycle_state, current_day_key, pending_open_rebuild,
/// is_trading_enabled) and advances them once per call to `tick`, spec
/// §4.12. Callers own the domain list and decide what a "tradeable day"
/// means (the daily tick loop only calls `tick` when a real trading-day
/// boundary check — spec §4.11 step 2 — has already run).
pub struct DayLifecycleManager {
    domains: Vec<Box<dyn LifecycleDomain>>,
    retry_delay: chrono::Duration,
    inner: parking_lot::Mutex<Inner>,
}

impl DayLifecycleManager {
    pub fn new(domains: Vec<Box<dyn LifecycleDomain>>, retry_delay_ms: u64) -> Self {
        Self {
            domains,
            retry_delay: chrono::Duration::milliseconds(retry_delay_ms as i64),
            inner: parking_lot::Mutex::new(Inner {
                state: LifecycleState::Active,
                current_day_key: None,
                pending_open_rebuild: false,
                is_trading_enabled: true,
                next_retry_at: None,
            }),
        }
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let inner = self.inner.lock();
        LifecycleSnapshot {
            state: inner.state,
            current_day_key: inner.current_day_key.clone(),
            pending_open_rebuild: inner.pending_open_rebuild,
            is_trading_enabled: inner.is_trading_enabled,
        }
    }

    /// Advance the lifecycle by one step. `runtime_day_key` is the trading
    /// day key derived from `now` by the caller; `is_tradeable_day` reports
    /// whether `runtime_day_key` is a day the engine may trade on at all
    /// (used to gate the open-rebuild step — spec: "runtime is in a
    /// tradeable day and allowed").
    pub async fn tick(&self, runtime_day_key: &str, is_tradeable_day: bool, now: DateTime<Utc>) {
        let day_rolled_over = {
            let inner = self.inner.lock();
            inner.current_day_key.as_deref() != Some(runtime_day_key)
        };

        if day_rolled_over {
            self.run_midnight_clear(runtime_day_key, now).await;
            return;
        }

        let should_rebuild = {
            let inner = self.inner.lock();
            inner.pending_open_rebuild && is_tradeable_day && self.retry_due(&inner, now)
        };
        if should_rebuild {
            self.run_open_rebuild(now).await;
        }
    }

    fn retry_due(&self, inner: &Inner, now: DateTime<Utc>) -> bool {
        inner.next_retry_at.map(|t| now >= t).unwrap_or(true)
    }

    async fn run_midnight_clear(&self, new_day_key: &str, now: DateTime<Utc>) {
        {
            let mut inner = self.inner.lock();
            if !self.retry_due(&inner, now) {
                return;
            }
            inner.state = LifecycleState::MidnightCleaning;
        }

        for domain in &self.domains {
            if let Err(e) = domain.midnight_clear().await {
                error!(domain = domain.name(), error = %e, "midnight_clear failed, will retry");
                let mut inner = self.inner.lock();
                inner.next_retry_at = Some(now + self.retry_delay);
                return;
            }
        }

        let mut inner = self.inner.lock();
        inner.state = LifecycleState::MidnightCleaned;
        inner.current_day_key = Some(new_day_key.to_string());
        inner.pending_open_rebuild = true;
        inner.is_trading_enabled = false;
        inner.next_retry_at = None;
        info!(day_key = new_day_key, "midnight clear complete, awaiting open rebuild");
    }

    async fn run_open_rebuild(&self, now: DateTime<Utc>) {
        for domain in self.domains.iter().rev() {
            if let Err(e) = domain.open_rebuild().await {
                error!(domain = domain.name(), error = %e, "open_rebuild failed, will retry");
                let mut inner = self.inner.lock();
                inner.state = LifecycleState::OpenRebuildFailed;
                inner.next_retry_at = Some(now + self.retry_delay);
                return;
            }
        }

        let mut inner = self.inner.lock();
        inner.state = LifecycleState::Active;
        inner.pending_open_rebuild = false;
        inner.is_trading_enabled = true;
        inner.next_retry_at = None;
        info!("open rebuild complete, trading gate re-opened");
    }

    pub fn is_trading_enabled(&self) -> bool {
        self.inner.lock().is_trading_enabled
    }
}

/// Test/diagnostic domain that always succeeds — also useful as a
/// placeholder for cache domains not yet split out of a monolithic state
/// struct.
pub struct NoopDomain {
    name: String,
}

impl NoopDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl LifecycleDomain for NoopDomain {
    fn name(&self) -> &str {
        &self.name
    }
    async fn midnight_clear(&self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn open_rebuild(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingDomain {
        name: String,
        order: Arc<parking_lot::Mutex<Vec<String>>>,
        fail_clears: AtomicUsize,
        fail_rebuilds: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LifecycleDomain for RecordingDomain {
        fn name(&self) -> &str {
            &self.name
        }
        async fn midnight_clear(&self) -> Result<(), EngineError> {
            if self.fail_clears.fetch_sub(1, Ordering::SeqCst) > 0 && self.fail_clears.load(Ordering::SeqCst) != usize::MAX {
                return Err(EngineError::LifecycleStep(format!("{} clear failed", self.name)));
            }
            self.order.lock().push(format!("clear:{}", self.name));
            Ok(())
        }
        async fn open_rebuild(&self) -> Result<(), EngineError> {
            if self.fail_rebuilds.fetch_sub(1, Ordering::SeqCst) > 0 && self.fail_rebuilds.load(Ordering::SeqCst) != usize::MAX {
                return Err(EngineError::LifecycleStep(format!("{} rebuild failed", self.name)));
            }
            self.order.lock().push(format!("rebuild:{}", self.name));
            Ok(())
        }
    }

    fn domain(name: &str, order: Arc<parking_lot::Mutex<Vec<String>>>) -> RecordingDomain {
        RecordingDomain {
            name: name.to_string(),
            order,
            fail_clears: AtomicUsize::new(0),
            fail_rebuilds: AtomicUsize::new(0),
        }
    }

    fn t(hour: u32, min: u32) -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2026, 7, 28, hour, min, 0).unwrap()
    }

    #[tokio::test]
    async fn clear_runs_forward_rebuild_runs_backward() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let manager = DayLifecycleManager::new(
            vec![Box::new(domain("registry", order.clone())), Box::new(domain("recorder", order.clone())), Box::new(domain("cache", order.clone()))],
            1000,
        );

        manager.tick("2026-07-28", false, t(0, 0)).await;
        assert_eq!(manager.snapshot().state, LifecycleState::MidnightCleaned);
        assert!(!manager.is_trading_enabled());

        manager.tick("2026-07-28", true, t(9, 0)).await;
        assert_eq!(manager.snapshot().state, LifecycleState::Active);
        assert!(manager.is_trading_enabled());

        assert_eq!(
            *order.lock(),
            vec!["clear:registry", "clear:recorder", "clear:cache", "rebuild:cache", "rebuild:recorder", "rebuild:registry"]
        );
    }

    #[tokio::test]
    async fn clear_failure_keeps_midnight_cleaning_and_retries_after_delay() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut failing = domain("registry", order.clone());
        *failing.fail_clears.get_mut() = 1;
        let manager = DayLifecycleManager::new(vec![Box::new(failing)], 50);

        manager.tick("2026-07-28", false, t(0, 0)).await;
        assert_eq!(manager.snapshot().state, LifecycleState::MidnightCleaning);

        // Retry too soon: still cleaning.
        manager.tick("2026-07-28", false, t(0, 0)).await;
        assert_eq!(manager.snapshot().state, LifecycleState::MidnightCleaning);
    }

    #[tokio::test]
    async fn rebuild_failure_sets_open_rebuild_failed_and_retries() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut failing = domain("registry", order.clone());
        *failing.fail_rebuilds.get_mut() = 1;
        let manager = DayLifecycleManager::new(vec![Box::new(failing)], 50);

        manager.tick("2026-07-28", false, t(0, 0)).await;
        assert_eq!(manager.snapshot().state, LifecycleState::MidnightCleaned);

        manager.tick("2026-07-28", true, t(9, 0)).await;
        assert_eq!(manager.snapshot().state, LifecycleState::OpenRebuildFailed);
        assert!(!manager.is_trading_enabled());
    }

    #[tokio::test]
    async fn no_rebuild_attempted_outside_a_tradeable_day() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let manager = DayLifecycleManager::new(vec![Box::new(domain("registry", order))], 50);

        manager.tick("2026-07-28", false, t(0, 0)).await;
        assert_eq!(manager.snapshot().state, LifecycleState::MidnightCleaned);

        manager.tick("2026-07-28", false, t(9, 0)).await;
        assert_eq!(manager.snapshot().state, LifecycleState::MidnightCleaned, "not a tradeable day yet, rebuild withheld");
    }
}
