//! Debounced task coordination for Quietline.
//!
//! Buffers inbound message fragments per user, defers processing until the user
//! goes quiet, supersedes stale deferred jobs, and serializes operator
//! escalations through a store-backed lock. All shared state lives in a
//! [`CoordinationStore`]; nothing here relies on an in-process mutex for
//! cross-worker exclusion.

mod accumulator;
mod config;
mod coordinator;
mod error;
mod keys;
mod lock;
mod queue;
mod reaper;
pub mod retry;
mod scheduler;
pub mod store;
mod types;
mod worker;

#[cfg(test)]
mod testing;

pub use accumulator::MessageAccumulator;
pub use config::{CoordinatorConfig, DebounceConfig, LockConfig, QueueConfig, ReaperConfig};
pub use coordinator::{Coordinator, SubmitReceipt};
pub use error::{CoreError, QueueError, Result, StoreError};
pub use keys::{KeySpace, clean_bot_url};
pub use lock::{DistributedLock, LOCK_SENTINEL, LockOutcome};
pub use queue::{
    CancelOutcome, Job, JobOutcome, JobQueue, JobSpec, JobState, LocalJobQueue, QueueStats,
};
pub use reaper::{ReapReport, StaleLockReaper};
pub use retry::RetryPolicy;
pub use scheduler::{ScheduleReceipt, Superseded, SupersedingScheduler};
pub use store::{Batch, Command, CoordinationStore, KeyTtl, MemoryStore, RedisStore, Reply};
pub use types::{JobId, MergedBurst, ReplyAck, ReplyPipeline, ReplySeed, UserId};
pub use worker::{DebouncedWorker, WorkerOutcome, merge_fragments};
