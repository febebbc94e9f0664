//! Per-key request admission control.
//!
//! A token bucket per key, encoded as a single advancing reset timestamp so
//! admission is one compare-and-add under a microsecond-scale lock. Two
//! deployment shapes share the core:
//!
//! - [`KeyedLimiter`] — local mode, one process governing itself.
//! - [`SyncLimiter`] — distributed mode: every participant admits locally,
//!   and a background reconciler periodically exchanges per-key deltas with a
//!   shared counter (any [`SharedCounter`] backend) so the cluster converges
//!   on one logical budget per key.
//!
//! ```
//! use keylimit::{KeyedLimiter, LimitConfig};
//!
//! let limiter = KeyedLimiter::new();
//! let cfg = LimitConfig::new(100.0, 10); // 100 tokens/s, burst of 10
//! assert!(limiter.allow("user:42", cfg).unwrap());
//! ```

pub mod clock;
pub mod counter;
pub mod distributed;
pub mod error;
pub mod limiter;
pub mod local;
pub mod registry;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{MemoryCounter, SharedCounter};
pub use distributed::{SyncLimiter, SyncLimiterBuilder};
pub use error::{CounterError, LimitError, SyncError};
pub use limiter::{LimitConfig, Limiter, ResetLimiter};
pub use local::KeyedLimiter;
pub use registry::Registry;
pub use sync::{CorruptedRemotePolicy, ErrorDisposition};
