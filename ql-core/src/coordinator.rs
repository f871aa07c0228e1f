use crate::accumulator::MessageAccumulator;
use crate::config::CoordinatorConfig;
use crate::error::{CoreError, Result};
use crate::keys::KeySpace;
use crate::lock::{DistributedLock, LockOutcome};
use crate::queue::JobQueue;
use crate::reaper::{ReapReport, StaleLockReaper};
use crate::scheduler::{Superseded, SupersedingScheduler};
use crate::store::{CoordinationStore, StoreResult};
use crate::types::{JobId, ReplyPipeline, ReplySeed, UserId};
use crate::worker::DebouncedWorker;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    /// Buffer length after this fragment was appended.
    pub buffered: u64,
    pub job_id: JobId,
    pub superseded: Option<Superseded>,
}

/// Front door of the core. Wires the accumulator, scheduler, lock and reaper
/// over one store and one queue.
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    queue: Arc<dyn JobQueue>,
    keys: KeySpace,
    cfg: CoordinatorConfig,
    accumulator: MessageAccumulator,
    scheduler: SupersedingScheduler,
    lock: DistributedLock,
    reaper: StaleLockReaper,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        queue: Arc<dyn JobQueue>,
        keys: KeySpace,
        pipeline: Arc<dyn ReplyPipeline>,
        cfg: CoordinatorConfig,
    ) -> Result<Self> {
        cfg.validate()?;
        let debounce = &cfg.debounce;
        let accumulator = MessageAccumulator::new(
            store.clone(),
            keys.clone(),
            debounce.buffer_ttl(),
            debounce.store_retry,
        );
        let worker = DebouncedWorker::new(accumulator.clone(), pipeline);
        let scheduler = SupersedingScheduler::new(
            store.clone(),
            queue.clone(),
            worker,
            keys.clone(),
            debounce.clone(),
        );
        let lock = DistributedLock::new(store.clone(), &cfg.lock, debounce.store_retry);
        let reaper = StaleLockReaper::new(store.clone(), keys.clone());
        Ok(Self {
            store,
            queue,
            keys,
            cfg,
            accumulator,
            scheduler,
            lock,
            reaper,
        })
    }

    /// Registers the periodic stale lock sweep when enabled.
    pub async fn start(&self) -> Result<()> {
        if !self.cfg.reaper.enabled {
            tracing::info!("stale lock reaper disabled");
            return Ok(());
        }
        self.queue
            .register_recurring(self.cfg.reaper.interval(), Arc::new(self.reaper.clone()))
            .await?;
        Ok(())
    }

    /// Buffers a fragment and (re)schedules the user's deferred reply job.
    #[tracing::instrument(level = "info", skip_all, fields(user = %seed.user))]
    pub async fn submit(&self, seed: ReplySeed) -> Result<SubmitReceipt> {
        if seed.user.is_empty() {
            return Err(CoreError::Config("user id must not be empty".to_string()));
        }
        let buffered = self.accumulator.append(&seed.user, &seed.text).await?;
        let user = seed.user.clone();
        let fragment = seed.text.clone();
        let receipt = match self
            .scheduler
            .schedule(seed, self.cfg.debounce.quiet_period())
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                // A redelivered webhook would otherwise buffer the fragment twice.
                match self.accumulator.retract(&user, &fragment).await {
                    Ok(removed) => {
                        tracing::warn!(user = %user, removed, error = %e, "schedule failed; fragment retracted")
                    }
                    Err(retract_err) => tracing::error!(
                        user = %user,
                        error = %e,
                        retract_error = %retract_err,
                        "schedule failed and fragment could not be retracted"
                    ),
                }
                return Err(e);
            }
        };
        Ok(SubmitReceipt {
            buffered,
            job_id: receipt.job_id,
            superseded: receipt.superseded,
        })
    }

    /// Runs `op` under the user's lock. `NotAcquired` means another worker is
    /// already handling this user.
    pub async fn escalate<T, F, Fut>(&self, user: &UserId, op: F) -> StoreResult<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock.with_lock(&self.keys.lock(user), op).await
    }

    pub async fn sweep_locks(&self) -> StoreResult<ReapReport> {
        self.reaper.sweep().await
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
