//! Deferred job queue.
//!
//! Every job moves through a tagged state machine:
//!
//! ```text
//! Scheduled ──cancel──▶ CancelRequested ──▶ Done(Canceled)
//!     │                                         ▲
//!     └──delay elapsed──▶ Running ──────────────┘ Done(Completed | Failed | TimedOut)
//! ```
//!
//! `CancelRequested` is advisory. Once a job is `Running` it finishes
//! regardless, and against a shared store another worker may already hold the
//! job, so callers must not treat cancellation as proof of non-execution.

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::types::JobId;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    TimedOut,
    Canceled,
    /// Became due but could not start inside its start window.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "outcome", rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    CancelRequested,
    Running,
    Done(JobOutcome),
}

impl JobState {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Running | Self::Done(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Requested,
    AlreadyRunning,
    AlreadyFinished,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub delay: Duration,
    pub start_window: Option<Duration>,
    /// Caller-chosen id, so the id can be published before the job exists.
    pub id: Option<JobId>,
}

impl JobSpec {
    pub fn after(delay: Duration) -> Self {
        Self {
            delay,
            start_window: None,
            id: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_start_window(mut self, window: Duration) -> Self {
        self.start_window = Some(window);
        self
    }
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, spec: JobSpec, job: Box<dyn Job>) -> Result<JobId, QueueError>;

    /// `None` when the queue has no record of the job (never seen, or pruned).
    async fn status(&self, id: &JobId) -> Option<JobState>;

    async fn cancel(&self, id: &JobId) -> CancelOutcome;

    async fn register_recurring(
        &self,
        interval: Duration,
        job: Arc<dyn Job>,
    ) -> Result<(), QueueError>;

    async fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub scheduled: usize,
    pub running: usize,
    pub finished: usize,
}

struct JobRecord {
    name: &'static str,
    state: JobState,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

type JobTable = Arc<DashMap<JobId, JobRecord>>;

/// In-process queue backed by tokio tasks. Concurrency of running job bodies is
/// bounded by a semaphore; waiting for the delay does not hold a slot.
pub struct LocalJobQueue {
    cfg: QueueConfig,
    jobs: JobTable,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl LocalJobQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrency.max(1)));
        Self {
            cfg,
            jobs: Arc::new(DashMap::new()),
            permits,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.jobs.iter() {
            match entry.value().state {
                JobState::Scheduled | JobState::CancelRequested => stats.scheduled += 1,
                JobState::Running => stats.running += 1,
                JobState::Done(_) => stats.finished += 1,
            }
        }
        stats
    }

    fn prune_finished(&self) {
        let retention = self.cfg.result_retention();
        let now = Instant::now();
        self.jobs.retain(|_, record| {
            record
                .finished_at
                .is_none_or(|at| now.saturating_duration_since(at) < retention)
        });
    }
}

fn finish(jobs: &JobTable, id: &JobId, outcome: JobOutcome) {
    if let Some(mut record) = jobs.get_mut(id) {
        record.state = JobState::Done(outcome);
        record.finished_at = Some(Instant::now());
    }
}

/// Moves a job from `Scheduled` to `Running`. Anything else means it was
/// canceled while waiting.
fn try_start(jobs: &JobTable, id: &JobId) -> bool {
    match jobs.get_mut(id) {
        Some(mut record) if record.state == JobState::Scheduled => {
            record.state = JobState::Running;
            true
        }
        _ => false,
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run_guarded(job: &dyn Job, time_limit: Duration) -> JobOutcome {
    match tokio::time::timeout(time_limit, AssertUnwindSafe(job.run()).catch_unwind()).await {
        Ok(Ok(Ok(()))) => JobOutcome::Completed,
        Ok(Ok(Err(e))) => {
            tracing::warn!(job = job.name(), error = %e, "job failed");
            JobOutcome::Failed
        }
        Ok(Err(_panic)) => {
            tracing::error!(job = job.name(), "job panicked");
            JobOutcome::Failed
        }
        Err(_) => {
            tracing::warn!(
                job = job.name(),
                time_limit_seconds = time_limit.as_secs(),
                "job exceeded time limit"
            );
            JobOutcome::TimedOut
        }
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    #[tracing::instrument(level = "debug", skip_all, fields(job = job.name()))]
    async fn enqueue(&self, spec: JobSpec, job: Box<dyn Job>) -> Result<JobId, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        if spec.start_window.is_some_and(|w| w.is_zero()) {
            return Err(QueueError::InvalidSpec(
                "start window must be > 0 when set".to_string(),
            ));
        }
        self.prune_finished();

        let id = match &spec.id {
            Some(id) if self.jobs.contains_key(id) => {
                return Err(QueueError::InvalidSpec(format!("job id {id} is already queued")));
            }
            Some(id) => id.clone(),
            None => JobId::new(Uuid::new_v4().to_string()),
        };
        let cancel = self.shutdown.child_token();
        self.jobs.insert(
            id.clone(),
            JobRecord {
                name: job.name(),
                state: JobState::Scheduled,
                cancel: cancel.clone(),
                finished_at: None,
            },
        );

        let jobs = self.jobs.clone();
        let permits = self.permits.clone();
        let time_limit = self.cfg.time_limit();
        let job_id = id.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(spec.delay) => {}
                _ = cancel.cancelled() => {
                    tracing::debug!(job_id = %job_id, "job canceled before it became due");
                    finish(&jobs, &job_id, JobOutcome::Canceled);
                    return;
                }
            }

            let start_deadline = spec.start_window.map(|w| Instant::now() + w);
            let permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        finish(&jobs, &job_id, JobOutcome::Canceled);
                        return;
                    }
                },
                _ = cancel.cancelled() => {
                    finish(&jobs, &job_id, JobOutcome::Canceled);
                    return;
                }
                _ = sleep_until_or_forever(start_deadline) => {
                    tracing::warn!(job_id = %job_id, job = job.name(), "job expired before a worker slot freed up");
                    finish(&jobs, &job_id, JobOutcome::Expired);
                    return;
                }
            };

            if !try_start(&jobs, &job_id) {
                finish(&jobs, &job_id, JobOutcome::Canceled);
                return;
            }
            tracing::debug!(job_id = %job_id, job = job.name(), "job started");
            let outcome = run_guarded(job.as_ref(), time_limit).await;
            drop(permit);
            tracing::debug!(job_id = %job_id, ?outcome, "job finished");
            finish(&jobs, &job_id, outcome);
        });

        Ok(id)
    }

    async fn status(&self, id: &JobId) -> Option<JobState> {
        self.jobs.get(id).map(|record| record.state)
    }

    async fn cancel(&self, id: &JobId) -> CancelOutcome {
        let Some(mut record) = self.jobs.get_mut(id) else {
            return CancelOutcome::Unknown;
        };
        match record.state {
            JobState::Scheduled => {
                record.state = JobState::CancelRequested;
                record.cancel.cancel();
                tracing::debug!(job_id = %id, job = record.name, "job cancellation requested");
                CancelOutcome::Requested
            }
            JobState::CancelRequested => CancelOutcome::Requested,
            JobState::Running => CancelOutcome::AlreadyRunning,
            JobState::Done(_) => CancelOutcome::AlreadyFinished,
        }
    }

    async fn register_recurring(
        &self,
        interval: Duration,
        job: Arc<dyn Job>,
    ) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        if interval.is_zero() {
            return Err(QueueError::InvalidSpec(
                "recurring interval must be > 0".to_string(),
            ));
        }
        let shutdown = self.shutdown.child_token();
        let time_limit = self.cfg.time_limit();
        tracing::info!(
            job = job.name(),
            interval_seconds = interval.as_secs(),
            "recurring job registered"
        );
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(job = job.name(), "recurring job received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let outcome = run_guarded(job.as_ref(), time_limit).await;
                        tracing::debug!(job = job.name(), ?outcome, "recurring job tick finished");
                    }
                }
            }
        });
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.cfg.time_limit(), self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("timed out waiting for job queue tasks to finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        work: Duration,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) -> anyhow::Result<()> {
            tokio::time::sleep(self.work).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(runs: &Arc<AtomicUsize>, work: Duration) -> Box<dyn Job> {
        Box::new(CountingJob {
            runs: runs.clone(),
            work,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn caller_chosen_id_is_used_once() {
        let queue = LocalJobQueue::new(QueueConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let chosen = JobId::new("burst-1");
        let id = queue
            .enqueue(
                JobSpec::after(Duration::from_secs(1)).with_id(chosen.clone()),
                counting(&runs, Duration::ZERO),
            )
            .await
            .expect("enqueue");
        assert_eq!(id, chosen);
        let err = queue
            .enqueue(
                JobSpec::after(Duration::from_secs(1)).with_id(chosen.clone()),
                counting(&runs, Duration::ZERO),
            )
            .await
            .expect_err("duplicate id");
        assert!(matches!(err, QueueError::InvalidSpec(_)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_job_after_delay() {
        let queue = LocalJobQueue::new(QueueConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let id = queue
            .enqueue(JobSpec::after(Duration::from_secs(9)), counting(&runs, Duration::ZERO))
            .await
            .expect("enqueue");
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(queue.status(&id).await, Some(JobState::Scheduled));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.status(&id).await,
            Some(JobState::Done(JobOutcome::Completed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_job_never_runs() {
        let queue = LocalJobQueue::new(QueueConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let id = queue
            .enqueue(JobSpec::after(Duration::from_secs(5)), counting(&runs, Duration::ZERO))
            .await
            .expect("enqueue");
        assert_eq!(queue.cancel(&id).await, CancelOutcome::Requested);
        assert_eq!(queue.status(&id).await, Some(JobState::CancelRequested));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            queue.status(&id).await,
            Some(JobState::Done(JobOutcome::Canceled))
        );
        assert_eq!(queue.cancel(&id).await, CancelOutcome::AlreadyFinished);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_does_not_stop_a_running_job() {
        let queue = LocalJobQueue::new(QueueConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let id = queue
            .enqueue(
                JobSpec::after(Duration::from_secs(1)),
                counting(&runs, Duration::from_secs(5)),
            )
            .await
            .expect("enqueue");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.status(&id).await, Some(JobState::Running));
        assert_eq!(queue.cancel(&id).await, CancelOutcome::AlreadyRunning);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.status(&id).await,
            Some(JobState::Done(JobOutcome::Completed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_marks_job_timed_out() {
        let queue = LocalJobQueue::new(QueueConfig {
            time_limit_seconds: 2,
            ..QueueConfig::default()
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let id = queue
            .enqueue(JobSpec::after(Duration::ZERO), counting(&runs, Duration::from_secs(60)))
            .await
            .expect("enqueue");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            queue.status(&id).await,
            Some(JobState::Done(JobOutcome::TimedOut))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn due_job_expires_when_no_slot_frees_up() {
        let queue = LocalJobQueue::new(QueueConfig {
            max_concurrency: 1,
            ..QueueConfig::default()
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let blocker = queue
            .enqueue(JobSpec::after(Duration::ZERO), counting(&runs, Duration::from_secs(30)))
            .await
            .expect("enqueue blocker");
        let late = queue
            .enqueue(
                JobSpec::after(Duration::from_secs(1))
                    .with_start_window(Duration::from_secs(5)),
                counting(&runs, Duration::ZERO),
            )
            .await
            .expect("enqueue late");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            queue.status(&late).await,
            Some(JobState::Done(JobOutcome::Expired))
        );
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(
            queue.status(&blocker).await,
            Some(JobState::Done(JobOutcome::Completed))
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_job_ticks_until_shutdown() {
        let queue = LocalJobQueue::new(QueueConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        queue
            .register_recurring(
                Duration::from_secs(100),
                Arc::new(CountingJob {
                    runs: runs.clone(),
                    work: Duration::ZERO,
                }),
            )
            .await
            .expect("register");
        tokio::time::sleep(Duration::from_secs(99)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(202)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        queue.shutdown().await;
        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_jobs_and_rejects_new_ones() {
        let queue = LocalJobQueue::new(QueueConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let id = queue
            .enqueue(JobSpec::after(Duration::from_secs(30)), counting(&runs, Duration::ZERO))
            .await
            .expect("enqueue");
        queue.shutdown().await;
        assert_eq!(
            queue.status(&id).await,
            Some(JobState::Done(JobOutcome::Canceled))
        );
        let err = queue
            .enqueue(JobSpec::after(Duration::ZERO), counting(&runs, Duration::ZERO))
            .await
            .expect_err("queue is shut down");
        assert!(matches!(err, QueueError::ShutDown));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
