use crate::config::DebounceConfig;
use crate::error::{CoreError, QueueError};
use crate::keys::KeySpace;
use crate::queue::{CancelOutcome, JobQueue, JobSpec, JobState};
use crate::store::{CoordinationStore, with_retry};
use crate::types::{JobId, ReplySeed};
use crate::worker::{DebounceJob, DebouncedWorker};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Superseded {
    pub job_id: JobId,
    pub cancel: CancelOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleReceipt {
    pub job_id: JobId,
    pub superseded: Option<Superseded>,
}

/// Keeps at most one live deferred job per user. Scheduling a new job
/// best-effort cancels the previous one and overwrites the handle.
///
/// Cancellation is advisory and only reaches jobs queued in this process. The
/// handle in the store is authoritative: a job drains only while the handle
/// names it (or after a drain removed it), so a job superseded from another
/// process steps aside on its own. The drain's atomicity keeps delivery
/// at-most-once.
#[derive(Clone)]
pub struct SupersedingScheduler {
    store: Arc<dyn CoordinationStore>,
    queue: Arc<dyn JobQueue>,
    worker: DebouncedWorker,
    keys: KeySpace,
    cfg: DebounceConfig,
}

impl SupersedingScheduler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        queue: Arc<dyn JobQueue>,
        worker: DebouncedWorker,
        keys: KeySpace,
        cfg: DebounceConfig,
    ) -> Self {
        Self {
            store,
            queue,
            worker,
            keys,
            cfg,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(user = %seed.user, delay_ms = delay.as_millis() as u64))]
    pub async fn schedule(
        &self,
        seed: ReplySeed,
        delay: Duration,
    ) -> Result<ScheduleReceipt, CoreError> {
        if delay >= self.cfg.handle_ttl() {
            return Err(QueueError::InvalidSpec(format!(
                "delay {}ms must be shorter than the handle ttl {}s",
                delay.as_millis(),
                self.cfg.handle_ttl_seconds
            ))
            .into());
        }
        let handle_key = self.keys.pending_job(&seed.user);
        let policy = self.cfg.store_retry;

        let previous = with_retry(policy, "scheduler.get_handle", |_| {
            self.store.get(&handle_key)
        })
        .await?;

        let superseded = match previous {
            Some(previous) => {
                let previous = JobId::new(previous);
                with_retry(policy, "scheduler.refresh_handle", |_| {
                    self.store.expire(&handle_key, self.cfg.handle_refresh_ttl())
                })
                .await?;
                let cancel = self.supersede(&previous).await;
                tracing::debug!(previous_job = %previous, ?cancel, "superseding pending job");
                Some(Superseded {
                    job_id: previous,
                    cancel,
                })
            }
            None => None,
        };

        // The handle is written before the job exists so the job can never
        // observe a stale handle and step aside for a predecessor.
        let job_id = JobId::new(Uuid::new_v4().to_string());
        with_retry(policy, "scheduler.write_handle", |_| {
            self.store
                .set_ex(&handle_key, job_id.as_str(), self.cfg.handle_ttl())
        })
        .await?;

        let job = DebounceJob::new(self.worker.clone(), seed, job_id.clone());
        let spec = JobSpec::after(delay)
            .with_start_window(self.cfg.start_window())
            .with_id(job_id.clone());
        if let Err(e) = self.queue.enqueue(spec, Box::new(job)).await {
            if let Err(del_err) = self.store.del(&handle_key).await {
                tracing::warn!(error = %del_err, "failed to clear handle of unqueued job");
            }
            return Err(e.into());
        }

        tracing::info!(job_id = %job_id, superseded = superseded.is_some(), "deferred job scheduled");
        Ok(ScheduleReceipt { job_id, superseded })
    }

    async fn supersede(&self, previous: &JobId) -> CancelOutcome {
        match self.queue.status(previous).await {
            Some(JobState::Done(_)) => CancelOutcome::AlreadyFinished,
            Some(state) if state.is_started() => CancelOutcome::AlreadyRunning,
            Some(_) => self.queue.cancel(previous).await,
            None => CancelOutcome::Unknown,
        }
    }
}
