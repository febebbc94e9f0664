use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::clock::{Clock, SystemClock};
use crate::counter::SharedCounter;
use crate::error::{LimitError, SyncError};
use crate::limiter::{validate, LimitConfig, Limiter, ResetLimiter};
use crate::local::record_admission;
use crate::registry::Registry;
use crate::sync::{
    default_error_handler, CorruptedRemotePolicy, ErrorDisposition, Reconciler, SyncErrorHandler,
    SyncOptions,
};

/// Distributed-mode facade: every participant admits locally at full speed
/// while a background reconciler folds the cluster's consumption into each
/// key's budget through a shared counter.
///
/// Admission never waits on the store. Reconciliation failures never
/// invalidate the local limiter; in the worst case each participant
/// enforces its own view until the next successful round.
pub struct SyncLimiter<C: SharedCounter> {
    registry: Arc<Registry<ResetLimiter>>,
    reconciler: Arc<Reconciler<C>>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: SharedCounter> SyncLimiter<C> {
    pub fn builder(counter: Arc<C>) -> SyncLimiterBuilder<C> {
        SyncLimiterBuilder {
            counter,
            sync_interval: Duration::from_secs(1),
            policy: CorruptedRemotePolicy::UploadLocal,
            key_expiry: Duration::ZERO,
            op_timeout: None,
            disable_auto_sync: false,
            error_handler: None,
            clock: None,
        }
    }

    pub fn allow(&self, key: &str, cfg: LimitConfig) -> Result<bool, LimitError> {
        self.allow_n(key, 1, cfg)
    }

    pub fn allow_n(&self, key: &str, cost: i64, cfg: LimitConfig) -> Result<bool, LimitError> {
        validate(cost, &cfg)?;
        // Track before admitting, so a successful charge is always
        // reconcilable by the next round.
        self.reconciler.track(key);
        let limiter = self.registry.get_or_create(key);
        let admitted = limiter.allow_n(self.clock.now_ns(), cost, cfg);
        record_admission(admitted);
        Ok(admitted)
    }

    /// Charge unconditionally; the debt lands on future `allow` calls and is
    /// pushed to the cluster like any other consumption.
    pub fn force_n(&self, key: &str, cost: i64, cfg: LimitConfig) -> Result<bool, LimitError> {
        validate(cost, &cfg)?;
        self.reconciler.track(key);
        let limiter = self.registry.get_or_create(key);
        let admitted = limiter.force_n(self.clock.now_ns(), cost, cfg);
        record_admission(admitted);
        Ok(admitted)
    }

    /// Run one exchange for `key` right now, on the caller's task. The
    /// normal path is the background worker; this is for deployments that
    /// disabled auto-sync, and for tests.
    pub async fn sync_key(&self, key: &str) -> Result<(), SyncError> {
        self.reconciler.sync_one(key).await
    }

    /// Earliest instant (ns) at which `key`'s bucket is fully charged back;
    /// 0 for a key that was never touched. Observation hook.
    pub fn reset_at(&self, key: &str) -> i64 {
        self.registry.get(key).map(|l| l.reset_at()).unwrap_or(0)
    }

    /// Whether the reconciler currently carries state for `key`.
    pub fn is_tracked(&self, key: &str) -> bool {
        self.reconciler.is_tracked(key)
    }

    /// Failure recorded by the most recent sync round, if any. Admission
    /// verdicts are never withheld because of one; this is the out-of-band
    /// signal for callers that want to know the cluster view is stale.
    pub fn last_sync_error(&self) -> Option<SyncError> {
        self.reconciler.last_error()
    }

    /// Stop the background worker and wait for it to exit. The current
    /// per-key exchange, if one is in flight, completes first.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!("sync: worker join error: {}", e);
            }
        }
    }
}

impl<C: SharedCounter> Drop for SyncLimiter<C> {
    fn drop(&mut self) {
        // Cooperative stop even without an explicit shutdown().
        self.cancel.cancel();
    }
}

/// Builder for [`SyncLimiter`]. The only defaults are `sync_interval` (1 s)
/// and `corrupted_remote_policy` (`UploadLocal`); everything else is an
/// explicit choice.
pub struct SyncLimiterBuilder<C: SharedCounter> {
    counter: Arc<C>,
    sync_interval: Duration,
    policy: CorruptedRemotePolicy,
    key_expiry: Duration,
    op_timeout: Option<Duration>,
    disable_auto_sync: bool,
    error_handler: Option<SyncErrorHandler>,
    clock: Option<Arc<dyn Clock>>,
}

impl<C: SharedCounter> SyncLimiterBuilder<C> {
    /// Period between sync rounds. Smaller means tighter global accuracy and
    /// more store traffic.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Drop limiter and reconciler state for keys idle longer than this, and
    /// let the shared counter expire too. Zero disables expiry.
    pub fn key_expiry(mut self, expiry: Duration) -> Self {
        self.key_expiry = expiry;
        self
    }

    pub fn corrupted_remote_policy(mut self, policy: CorruptedRemotePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Deadline for each counter operation. Defaults to `sync_interval / 2`
    /// so one slow key cannot starve a round.
    pub fn op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Skip spawning the background worker; [`SyncLimiter::sync_key`] must
    /// be called explicitly.
    pub fn disable_auto_sync(mut self) -> Self {
        self.disable_auto_sync = true;
        self
    }

    /// Callback invoked with each per-key failure inside a round; its return
    /// value decides whether the round continues with the remaining keys.
    /// Default: log and continue.
    pub fn sync_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SyncError) -> ErrorDisposition + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the limiter. Unless auto-sync is disabled this spawns the
    /// background worker and therefore must run inside a tokio runtime.
    pub fn build(self) -> SyncLimiter<C> {
        let clock: Arc<dyn Clock> = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let registry = Arc::new(Registry::new(ResetLimiter::new));
        let reconciler = Arc::new(Reconciler::new(
            self.counter,
            registry.clone(),
            clock.clone(),
            SyncOptions {
                sync_interval: self.sync_interval,
                op_timeout: self.op_timeout.unwrap_or(self.sync_interval / 2),
                key_expiry: self.key_expiry,
                policy: self.policy,
                error_handler: self.error_handler.unwrap_or_else(default_error_handler),
            },
        ));

        let cancel = CancellationToken::new();
        let worker = if self.disable_auto_sync {
            None
        } else {
            Some(reconciler.spawn(cancel.clone()))
        };

        SyncLimiter {
            registry,
            reconciler,
            clock,
            cancel,
            worker: Mutex::new(worker),
        }
    }
}
