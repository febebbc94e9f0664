use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::SharedCounter;
use crate::clock::Clock;
use crate::error::CounterError;

/// In-process [`SharedCounter`] over a concurrent map.
///
/// Reference backend for tests and single-process clusters: every operation
/// is infallible, and TTLs expire lazily on the next access against the
/// injected clock, so test time stays fully hand-driven.
pub struct MemoryCounter {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

struct Entry {
    value: i64,
    expires_at_ns: Option<i64>,
}

impl MemoryCounter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Current value, honoring expiry. Test observation hook.
    pub fn value(&self, key: &str) -> Option<i64> {
        self.drop_if_expired(key);
        self.entries.get(key).map(|e| e.value)
    }

    /// Pending expiry instant, if a TTL is attached. Test observation hook.
    pub fn expires_at_ns(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(|e| e.expires_at_ns)
    }

    /// Delete a key outright; simulates remote loss in tests.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn drop_if_expired(&self, key: &str) {
        let now = self.clock.now_ns();
        self.entries
            .remove_if(key, |_, e| matches!(e.expires_at_ns, Some(at) if at <= now));
    }
}

impl SharedCounter for MemoryCounter {
    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool, CounterError> {
        self.drop_if_expired(key);
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    value,
                    expires_at_ns: None,
                });
                Ok(true)
            }
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CounterError> {
        self.drop_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at_ns: None,
        });
        entry.value = entry.value.saturating_add(delta);
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterError> {
        self.drop_if_expired(key);
        Ok(self.entries.get(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), CounterError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ns: None,
            },
        );
        Ok(())
    }

    async fn expire_if_not_yet(&self, key: &str, ttl: Duration) -> Result<(), CounterError> {
        let deadline = self
            .clock
            .now_ns()
            .saturating_add(ttl.as_nanos() as i64);
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at_ns.is_none() {
                entry.expires_at_ns = Some(deadline);
            }
        }
        Ok(())
    }
}
