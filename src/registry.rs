use dashmap::DashMap;
use std::sync::Arc;

/// Key → limiter map with concurrent get-or-create.
///
/// Lookup-then-insert-if-absent: the fast path is a read with no allocation;
/// on miss, losers of the insert race discard their construction before any
/// caller observes it, so per key at most one limiter ever reaches the map.
pub struct Registry<L> {
    limiters: DashMap<String, Arc<L>>,
    new_limiter: fn() -> L,
}

impl<L> Registry<L> {
    pub fn new(new_limiter: fn() -> L) -> Self {
        Self {
            limiters: DashMap::new(),
            new_limiter,
        }
    }

    pub fn get_or_create(&self, key: &str) -> Arc<L> {
        // Fast path: key already exists — no allocation.
        if let Some(entry) = self.limiters.get(key) {
            return entry.value().clone();
        }
        self.limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new((self.new_limiter)()))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<L>> {
        self.limiters.get(key).map(|e| e.value().clone())
    }

    /// Drop an idle key. Callers still holding the Arc keep a working (but
    /// no longer shared) limiter; the next get re-creates a fresh one.
    pub fn remove(&self, key: &str) {
        self.limiters.remove(key);
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
