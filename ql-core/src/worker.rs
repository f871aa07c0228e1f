use crate::accumulator::MessageAccumulator;
use crate::error::StoreError;
use crate::queue::Job;
use crate::types::{JobId, MergedBurst, ReplyAck, ReplyPipeline, ReplySeed};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Another job already drained the burst.
    Empty,
    /// The handle names a newer job, possibly owned by another process. That
    /// job drains the burst instead.
    Superseded { current: JobId },
    /// Fragments were drained but merged to whitespace only.
    Blank { fragments: usize },
    Delivered { fragments: usize, ack: ReplyAck },
    /// The burst was consumed but the pipeline failed. It is not re-buffered.
    DeliveryFailed { fragments: usize, error: String },
}

pub fn merge_fragments(fragments: &[String]) -> String {
    fragments.join(" ")
}

/// Body of a deferred debounce job: drain, merge, hand off.
#[derive(Clone)]
pub struct DebouncedWorker {
    accumulator: MessageAccumulator,
    pipeline: Arc<dyn ReplyPipeline>,
}

impl DebouncedWorker {
    pub fn new(accumulator: MessageAccumulator, pipeline: Arc<dyn ReplyPipeline>) -> Self {
        Self {
            accumulator,
            pipeline,
        }
    }

    /// Runs as job `job_id`: drains only if the pending-job handle still names
    /// this job or is gone. Cancellation of a job queued in another process
    /// cannot reach it, so the handle decides who drains.
    #[tracing::instrument(level = "info", skip_all, fields(user = %seed.user, job_id = %job_id))]
    pub async fn run_as(
        &self,
        seed: &ReplySeed,
        job_id: &JobId,
    ) -> Result<WorkerOutcome, StoreError> {
        match self.accumulator.pending_job(&seed.user).await? {
            Some(current) if current != *job_id => {
                tracing::info!(current_job = %current, "superseded by a newer job; not draining");
                Ok(WorkerOutcome::Superseded { current })
            }
            _ => self.run(seed).await,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(user = %seed.user))]
    pub async fn run(&self, seed: &ReplySeed) -> Result<WorkerOutcome, StoreError> {
        let fragments = self.accumulator.drain(&seed.user).await?;
        if fragments.is_empty() {
            tracing::debug!("nothing buffered; burst already handled");
            return Ok(WorkerOutcome::Empty);
        }
        let count = fragments.len();
        let merged = merge_fragments(&fragments);
        if merged.trim().is_empty() {
            tracing::debug!(fragments = count, "burst merged to blank text; skipping reply");
            return Ok(WorkerOutcome::Blank { fragments: count });
        }

        let burst = MergedBurst {
            seed: seed.clone().with_text(merged),
            fragments: count,
        };
        match self.pipeline.deliver(burst).await {
            Ok(ack) => {
                tracing::info!(fragments = count, "burst delivered");
                Ok(WorkerOutcome::Delivered {
                    fragments: count,
                    ack,
                })
            }
            Err(e) => {
                tracing::error!(fragments = count, error = %e, "reply pipeline failed");
                Ok(WorkerOutcome::DeliveryFailed {
                    fragments: count,
                    error: e.to_string(),
                })
            }
        }
    }
}

/// Queue adapter around [`DebouncedWorker::run`] for one seed.
pub(crate) struct DebounceJob {
    worker: DebouncedWorker,
    seed: ReplySeed,
    job_id: JobId,
}

impl DebounceJob {
    pub(crate) fn new(worker: DebouncedWorker, seed: ReplySeed, job_id: JobId) -> Self {
        Self {
            worker,
            seed,
            job_id,
        }
    }
}

#[async_trait]
impl Job for DebounceJob {
    fn name(&self) -> &'static str {
        "debounced_reply"
    }

    async fn run(&self) -> anyhow::Result<()> {
        match self.worker.run_as(&self.seed, &self.job_id).await? {
            WorkerOutcome::DeliveryFailed { error, .. } => {
                Err(anyhow::anyhow!("reply delivery failed: {error}"))
            }
            _ => Ok(()),
        }
    }
}
