// =============================================================================
// Error taxonomy — spec §7
// =============================================================================
//
// Five kinds of error, each with a distinct handling policy:
//   - Transient broker error:      logged, retried next tick/chase cycle.
//   - Logical precondition fail:   signal dropped, trade log FAILED.
//   - Recovery consistency fail:   fail-fast, abort startup.
//   - Lifecycle step fail:         state held, retried after delay.
//   - Validation fail:             signal dropped, no side effects.
//
// Critical errors carry a stable bracketed prefix so operators can grep logs
// for a subsystem regardless of the specific message, matching the reference
// engine's fixed circuit-breaker labels in `risk.rs`.
// =============================================================================

use thiserror::Error;

/// The error taxonomy from spec §7. Each variant documents its handling
/// policy; callers are expected to match on kind rather than string-sniff.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network/rate/unknown broker error. Caller should log and let the next
    /// tick or price-chase cycle retry; any cache touched by the call must be
    /// invalidated.
    #[error("[broker] transient error: {0}")]
    TransientBroker(String),

    /// Short-selling not supported, insufficient funds, or similar. The
    /// signal is dropped and a FAILED trade-log record is written; no state
    /// rollback is required because no mutation happened yet.
    #[error("[signal] precondition failed: {0}")]
    LogicalPrecondition(String),

    /// Orphan pending-sell, snapshot/tracked-set mismatch, unresolved sell
    /// ownership during recovery. Fail-fast: the runtime stays in
    /// BOOTSTRAPPING and the caller must abort startup.
    #[error("[order-monitor] recovery consistency failure: {0}")]
    RecoveryConsistency(String),

    /// `midnight_clear` or `open_rebuild` failed for a cache domain. The
    /// trade gate stays closed and the lifecycle manager retries after
    /// `rebuild_retry_delay_ms`.
    #[error("[lifecycle] step failed: {0}")]
    LifecycleStep(String),

    /// Invalid price/quantity/lot_size while building an order payload. The
    /// signal is dropped with a warning; no side effects occur.
    #[error("[executor] validation failed: {0}")]
    Validation(String),
}

impl EngineError {
    pub fn is_fail_fast(&self) -> bool {
        matches!(self, EngineError::RecoveryConsistency(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientBroker(_) | EngineError::LifecycleStep(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_consistency_is_fail_fast_only() {
        let e = EngineError::RecoveryConsistency("orphan pending sell".into());
        assert!(e.is_fail_fast());
        assert!(!e.is_retryable());

        let t = EngineError::TransientBroker("timeout".into());
        assert!(!t.is_fail_fast());
        assert!(t.is_retryable());
    }

    #[test]
    fn messages_carry_stable_prefix() {
        let e = EngineError::LifecycleStep("midnight_clear failed for cache X".into());
        assert!(e.to_string().starts_with("[lifecycle]"));
    }
}
