use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of nanosecond timestamps for admission decisions.
///
/// All timestamps in this crate are nanoseconds since the UNIX epoch so that
/// distributed participants agree on the zero point. Implementations must be
/// monotonic within a process; cross-process drift is tolerated by the sync
/// protocol (it exchanges deltas, not absolute times, after the first round).
pub trait Clock: Send + Sync + 'static {
    fn now_ns(&self) -> i64;
}

/// Wall-clock time, forced monotonic within the process.
///
/// `SystemTime` can step backwards under NTP adjustment; an atomic max over
/// the last returned value guarantees the limiter never sees time regress.
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        prev.max(wall)
    }
}

/// Hand-driven clock for tests.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ns: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ns),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as i64, Ordering::AcqRel);
    }

    pub fn set_ns(&self, now_ns: i64) {
        self.now.store(now_ns, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}
