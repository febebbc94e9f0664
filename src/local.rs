use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::error::LimitError;
use crate::limiter::{validate, LimitConfig, Limiter, ResetLimiter};
use crate::registry::Registry;

/// Local-mode facade: one process governs admission for itself.
///
/// Keyed limiters are created lazily on first use; the registry is generic
/// so a group can host any [`Limiter`] strategy.
pub struct KeyedLimiter<L: Limiter = ResetLimiter> {
    registry: Registry<L>,
    clock: Arc<dyn Clock>,
}

impl KeyedLimiter<ResetLimiter> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_limiter(ResetLimiter::new, clock)
    }

    /// Earliest instant (ns) at which `key`'s bucket is fully charged back;
    /// 0 for a key that was never touched. Observation hook.
    pub fn reset_at(&self, key: &str) -> i64 {
        self.registry.get(key).map(|l| l.reset_at()).unwrap_or(0)
    }
}

impl Default for KeyedLimiter<ResetLimiter> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Limiter> KeyedLimiter<L> {
    pub fn with_limiter(new_limiter: fn() -> L, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Registry::new(new_limiter),
            clock,
        }
    }

    pub fn allow(&self, key: &str, cfg: LimitConfig) -> Result<bool, LimitError> {
        self.allow_n(key, 1, cfg)
    }

    pub fn allow_n(&self, key: &str, cost: i64, cfg: LimitConfig) -> Result<bool, LimitError> {
        validate(cost, &cfg)?;
        let limiter = self.registry.get_or_create(key);
        let admitted = limiter.allow_n(self.clock.now_ns(), cost, cfg);
        record_admission(admitted);
        Ok(admitted)
    }

    /// Charge unconditionally; the debt lands on future `allow` calls.
    pub fn force_n(&self, key: &str, cost: i64, cfg: LimitConfig) -> Result<bool, LimitError> {
        validate(cost, &cfg)?;
        let limiter = self.registry.get_or_create(key);
        let admitted = limiter.force_n(self.clock.now_ns(), cost, cfg);
        record_admission(admitted);
        Ok(admitted)
    }
}

pub(crate) fn record_admission(admitted: bool) {
    if admitted {
        metrics::counter!("keylimit_admitted_total").increment(1);
    } else {
        metrics::counter!("keylimit_denied_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    const START: i64 = 3_600_000_000_000;

    fn limiter() -> (Arc<ManualClock>, KeyedLimiter) {
        let clock = Arc::new(ManualClock::new(START));
        let l = KeyedLimiter::with_clock(clock.clone());
        (clock, l)
    }

    #[test]
    fn test_allow_within_burst() {
        let (_clock, l) = limiter();
        let cfg = LimitConfig::new(10.0, 5);
        for _ in 0..5 {
            assert!(l.allow("k", cfg).unwrap());
        }
        assert!(!l.allow("k", cfg).unwrap());
    }

    #[test]
    fn test_replenishment_over_time() {
        let (clock, l) = limiter();
        let cfg = LimitConfig::new(10.0, 1);
        assert!(l.allow("k", cfg).unwrap());
        assert!(!l.allow("k", cfg).unwrap());
        clock.advance(Duration::from_millis(100));
        assert!(l.allow("k", cfg).unwrap());
    }

    #[test]
    fn test_keys_do_not_interfere() {
        let (_clock, l) = limiter();
        let cfg = LimitConfig::new(1.0, 1);
        assert!(l.allow("a", cfg).unwrap());
        assert!(!l.allow("a", cfg).unwrap());
        assert!(l.allow("b", cfg).unwrap());
    }

    #[test]
    fn test_cost_above_burst() {
        let (_clock, l) = limiter();
        let cfg = LimitConfig::new(10.0, 10);
        // AllowN denies outright; ForceN admits and charges.
        assert!(!l.allow_n("k", 11, cfg).unwrap());
        assert_eq!(l.reset_at("k"), 0);
        assert!(l.force_n("k", 11, cfg).unwrap());
        assert!(l.reset_at("k") > 0);
    }

    #[test]
    fn test_invalid_arguments() {
        let (_clock, l) = limiter();
        let cfg = LimitConfig::new(10.0, 10);
        assert_eq!(
            l.allow_n("k", 0, cfg),
            Err(LimitError::InvalidCost(0)),
        );
        assert!(matches!(
            l.allow_n("k", 1, LimitConfig::new(-1.0, 10)),
            Err(LimitError::InvalidRate(_))
        ));
        assert!(matches!(
            l.force_n("k", 1, LimitConfig::new(10.0, 0)),
            Err(LimitError::InvalidBurst(0))
        ));
        // Rejected arguments leave no state behind.
        assert_eq!(l.reset_at("k"), 0);
    }

    #[test]
    fn test_varying_budget_per_call() {
        let (_clock, l) = limiter();
        // Same key, tighter budget on the second call: the accumulated debt
        // carries over.
        assert!(l.allow_n("k", 5, LimitConfig::new(10.0, 5)).unwrap());
        assert!(!l.allow("k", LimitConfig::new(10.0, 5)).unwrap());
        assert!(!l.allow("k", LimitConfig::new(10.0, 1)).unwrap());
    }
}
