use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::counter::SharedCounter;
use crate::error::{CounterError, SyncError};
use crate::limiter::ResetLimiter;
use crate::registry::Registry;

/// Reaction when the shared counter for a key disappears or regresses below
/// the value this participant last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptedRemotePolicy {
    /// Re-publish the last observed value. Biases the cluster toward the
    /// largest `last_synced` across participants; assuming roughly even round
    /// spacing, every participant's deltas survive the rewrite.
    UploadLocal,
    /// Forget the sync history and start over as if never synced. Simpler,
    /// and makes no assumption about other participants; at most one
    /// interval's worth of delta is dropped.
    Reset,
}

/// What a sync round should do after the error handler has seen a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Move on to the remaining keys; the failed key retries next round.
    Continue,
    /// Stop the round; every unvisited key retries next round.
    AbortRound,
}

pub type SyncErrorHandler = Arc<dyn Fn(&SyncError) -> ErrorDisposition + Send + Sync>;

pub(crate) fn default_error_handler() -> SyncErrorHandler {
    Arc::new(|err: &SyncError| {
        tracing::error!("sync: {}", err);
        ErrorDisposition::Continue
    })
}

pub(crate) struct SyncOptions {
    pub sync_interval: Duration,
    /// Deadline applied around every counter operation so one slow key
    /// cannot starve the round.
    pub op_timeout: Duration,
    /// Zero disables expiry.
    pub key_expiry: Duration,
    pub policy: CorruptedRemotePolicy,
    pub error_handler: SyncErrorHandler,
}

/// Background protocol that converges per-key `reset_at` across participants.
///
/// Every tick, each tracked key exchanges its accumulated delta with the
/// shared counter: the delta is pushed with one atomic increment, and the
/// returned total reveals what the rest of the cluster consumed since our
/// previous exchange, which is folded back into the local limiter. No key
/// ever needs more than one round-trip per round, and admission calls never
/// wait on any of it.
pub(crate) struct Reconciler<C> {
    counter: Arc<C>,
    registry: Arc<Registry<ResetLimiter>>,
    /// Counter value most recently observed per key; 0 = never synced.
    /// Single writer (the worker); admission threads only insert-if-absent.
    last_synced: DashMap<String, i64>,
    clock: Arc<dyn Clock>,
    opts: SyncOptions,
    last_error: Mutex<Option<SyncError>>,
}

impl<C: SharedCounter> Reconciler<C> {
    pub fn new(
        counter: Arc<C>,
        registry: Arc<Registry<ResetLimiter>>,
        clock: Arc<dyn Clock>,
        opts: SyncOptions,
    ) -> Self {
        Self {
            counter,
            registry,
            last_synced: DashMap::new(),
            clock,
            opts,
            last_error: Mutex::new(None),
        }
    }

    /// Mark a key as reconcilable. Called on the admission path *before* the
    /// limiter is consulted, so any successful charge is guaranteed to be
    /// visible to the next round.
    pub fn track(&self, key: &str) {
        // Fast path: key already tracked — no allocation.
        if self.last_synced.contains_key(key) {
            return;
        }
        self.last_synced.entry(key.to_string()).or_insert(0);
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.last_synced.contains_key(key)
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.lock().unwrap().clone()
    }

    /// Start the worker. One round at a time: the next tick is not polled
    /// until the previous round has fully completed.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let period = reconciler.opts.sync_interval;
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("sync: worker stopped");
                        return;
                    }
                    _ = tick.tick() => {
                        reconciler.sync_all().await;
                    }
                }
            }
        })
    }

    /// One full round over the tracked key set.
    pub async fn sync_all(&self) {
        let expiry_cutoff = self.expiry_cutoff();
        let keys: Vec<String> = self.last_synced.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Err(err) = self.sync_key(&key, expiry_cutoff).await {
                metrics::counter!("keylimit_sync_errors_total").increment(1);
                *self.last_error.lock().unwrap() = Some(err.clone());
                match (self.opts.error_handler)(&err) {
                    ErrorDisposition::Continue => continue,
                    ErrorDisposition::AbortRound => {
                        warn!("sync: round aborted, key={}", err.key());
                        break;
                    }
                }
            }
        }
        metrics::counter!("keylimit_sync_rounds_total").increment(1);
        metrics::gauge!("keylimit_tracked_keys").set(self.last_synced.len() as f64);
        metrics::gauge!("keylimit_limiters").set(self.registry.len() as f64);
    }

    /// Manual single-key trigger (auto-sync disabled, or tests).
    pub async fn sync_one(&self, key: &str) -> Result<(), SyncError> {
        let res = self.sync_key(key, self.expiry_cutoff()).await;
        if let Err(ref err) = res {
            metrics::counter!("keylimit_sync_errors_total").increment(1);
            *self.last_error.lock().unwrap() = Some(err.clone());
        }
        res
    }

    fn expiry_cutoff(&self) -> i64 {
        if self.opts.key_expiry > Duration::ZERO {
            self.clock
                .now_ns()
                .saturating_sub(self.opts.key_expiry.as_nanos() as i64)
        } else {
            -1
        }
    }

    async fn sync_key(&self, key: &str, expiry_cutoff: i64) -> Result<(), SyncError> {
        let limiter = self.registry.get_or_create(key);
        let reset_at = limiter.reset_at();
        let delta = limiter.pop_delta();
        let last = self.last_synced.get(key).map(|e| *e.value()).unwrap_or(0);

        match self
            .exchange(key, &limiter, reset_at, delta, last, expiry_cutoff)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                // The popped delta never reached the counter; put it back so
                // the next round pushes it.
                limiter.add_delta(delta);
                Err(err)
            }
        }
    }

    async fn exchange(
        &self,
        key: &str,
        limiter: &ResetLimiter,
        reset_at: i64,
        delta: i64,
        last: i64,
        expiry_cutoff: i64,
    ) -> Result<(), SyncError> {
        // First sync with local history: try to establish the counter. The
        // published value already folds in the popped delta.
        if last == 0 && reset_at > 0 {
            let created = self
                .op(key, "set_if_absent", self.counter.set_if_absent(key, reset_at))
                .await?;
            if created {
                self.last_synced.insert(key.to_string(), reset_at);
                debug!("sync: counter established, key={}, reset_at={}", key, reset_at);
                return Ok(());
            }
            // Lost the race: another participant got there first. Fall
            // through and reconcile as a joiner.
        }

        let remote = if delta > 0 {
            self.op(key, "incr_by", self.counter.incr_by(key, delta))
                .await?
        } else {
            match self.op(key, "get", self.counter.get(key)).await? {
                Some(value) => value,
                // We synced before, now the key is gone: remote was lost.
                None if last != 0 => return self.recover_corrupted(key, limiter, delta, last).await,
                // Never synced, nothing local, nothing remote.
                None => return Ok(()),
            }
        };

        if last == 0 {
            // Joiner: the cluster enforced this key before we did. Absorbing
            // the remote total penalizes us once; from here on only deltas
            // flow, so the disadvantage dissipates round by round.
            if remote > reset_at {
                limiter.increment_reset_at(remote - reset_at);
            }
            self.last_synced.insert(key.to_string(), remote);
            return Ok(());
        }

        if remote < last {
            return self.recover_corrupted(key, limiter, delta, last).await;
        }

        // What the rest of the cluster consumed during our cycle.
        let diff = remote - last - delta;
        if diff > 0 {
            limiter.increment_reset_at(diff);
        }

        if expiry_cutoff >= 0 && reset_at < expiry_cutoff && delta == 0 {
            self.last_synced.remove(key);
            self.registry.remove(key);
            if diff == 0 {
                self.op(
                    key,
                    "expire_if_not_yet",
                    self.counter.expire_if_not_yet(key, self.opts.key_expiry),
                )
                .await?;
            }
            debug!("sync: idle key dropped, key={}", key);
            return Ok(());
        }

        self.last_synced.insert(key.to_string(), remote);
        Ok(())
    }

    async fn recover_corrupted(
        &self,
        key: &str,
        limiter: &ResetLimiter,
        delta: i64,
        last: i64,
    ) -> Result<(), SyncError> {
        warn!(
            "sync: remote counter lost or regressed, key={}, last_synced={}, policy={:?}",
            key, last, self.opts.policy
        );
        metrics::counter!("keylimit_sync_corruptions_total").increment(1);
        match self.opts.policy {
            CorruptedRemotePolicy::UploadLocal => {
                self.op(key, "set", self.counter.set(key, last)).await?;
            }
            CorruptedRemotePolicy::Reset => {
                self.last_synced.insert(key.to_string(), 0);
            }
        }
        // The delta was popped but never published under a healthy counter.
        limiter.add_delta(delta);
        Ok(())
    }

    async fn op<T>(
        &self,
        key: &str,
        name: &'static str,
        fut: impl Future<Output = Result<T, CounterError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.opts.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(CounterError::Transport(message))) => Err(SyncError::Transport {
                key: key.to_string(),
                message,
            }),
            Ok(Err(CounterError::Decode(message))) => Err(SyncError::Decode {
                key: key.to_string(),
                message,
            }),
            Err(_) => Err(SyncError::Timeout {
                key: key.to_string(),
                op: name,
            }),
        }
    }
}
