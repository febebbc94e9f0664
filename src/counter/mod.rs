pub mod memory;

pub use memory::MemoryCounter;

use std::future::Future;
use std::time::Duration;

use crate::error::CounterError;

/// Atomic operations over one signed 64-bit integer per key: the only
/// protocol surface a distributed deployment needs from its store.
///
/// A Redis-shaped backend maps these onto `SETNX`, `INCRBY`, `GET`, `SET`
/// and `EXPIRE NX`. The value for a key is the `reset_at` nanosecond
/// timestamp most recently published by some participant; no framing beyond
/// the store's own.
///
/// Implementations must be safe to call from the reconciler task; the
/// reconciler applies its own per-operation deadline around every call.
pub trait SharedCounter: Send + Sync + 'static {
    /// Set `key` to `value` iff absent. Returns whether this call created it.
    fn set_if_absent(
        &self,
        key: &str,
        value: i64,
    ) -> impl Future<Output = Result<bool, CounterError>> + Send;

    /// Atomic add, returning the new value. An absent key counts as 0.
    fn incr_by(
        &self,
        key: &str,
        delta: i64,
    ) -> impl Future<Output = Result<i64, CounterError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<i64>, CounterError>> + Send;

    /// Unconditional overwrite, clearing any TTL.
    fn set(&self, key: &str, value: i64)
        -> impl Future<Output = Result<(), CounterError>> + Send;

    /// Attach a time-to-live iff none is set; silent no-op otherwise.
    fn expire_if_not_yet(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), CounterError>> + Send;
}
