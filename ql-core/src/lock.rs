//! Store-backed mutual exclusion.
//!
//! A lock is a key created with SET NX plus an expiry, so a crashed holder
//! releases automatically once the TTL runs out. The lock is not fenced: a
//! holder whose critical section outlives the TTL can overlap with the next
//! holder.

use crate::config::LockConfig;
use crate::error::StoreError;
use crate::retry::{RetryPolicy, retry};
use crate::store::{CoordinationStore, StoreResult, with_retry};
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

pub const LOCK_SENTINEL: &str = "locked";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Acquired(T),
    NotAcquired,
}

impl<T> LockOutcome<T> {
    pub fn acquired(self) -> Option<T> {
        match self {
            Self::Acquired(value) => Some(value),
            Self::NotAcquired => None,
        }
    }
}

#[derive(Debug)]
enum AcquireError {
    Held,
    Store(StoreError),
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Held => f.write_str("lock held by another worker"),
            Self::Store(e) => e.fmt(f),
        }
    }
}

impl AcquireError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Held => true,
            Self::Store(e) => e.is_transient(),
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
    acquire_policy: RetryPolicy,
    release_policy: RetryPolicy,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>, cfg: &LockConfig, release_policy: RetryPolicy) -> Self {
        Self {
            store,
            ttl: cfg.ttl(),
            acquire_policy: cfg.acquire_policy(),
            release_policy,
        }
    }

    /// Single attempt. `true` when this caller now holds the lock.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.store.set_nx_ex(key, LOCK_SENTINEL, ttl).await
    }

    /// Polls with the configured fixed delay until the lock is taken or the
    /// attempts run out. Contention surfaces as `Ok(false)`.
    pub async fn acquire_with_retry(&self, key: &str) -> StoreResult<bool> {
        let result = retry(
            self.acquire_policy,
            "lock.acquire",
            |_| async {
                match self.acquire(key, self.ttl).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(AcquireError::Held),
                    Err(e) => Err(AcquireError::Store(e)),
                }
            },
            AcquireError::is_retryable,
        )
        .await;
        match result {
            Ok(()) => Ok(true),
            Err(AcquireError::Held) => Ok(false),
            Err(AcquireError::Store(e)) => Err(e),
        }
    }

    pub async fn release(&self, key: &str) -> StoreResult<bool> {
        with_retry(self.release_policy, "lock.release", |_| self.store.del(key)).await
    }

    /// Runs `op` while holding the lock at `key`. The lock is released on every
    /// exit path, including a panic inside `op`, which is then resumed.
    #[tracing::instrument(level = "debug", skip_all, fields(lock = %key))]
    pub async fn with_lock<T, F, Fut>(&self, key: &str, op: F) -> StoreResult<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire_with_retry(key).await? {
            tracing::info!(
                attempts = self.acquire_policy.max_attempts(),
                "lock still held after retries; skipping critical section"
            );
            return Ok(LockOutcome::NotAcquired);
        }

        let result = AssertUnwindSafe(op()).catch_unwind().await;
        if let Err(e) = self.release(key).await {
            tracing::warn!(error = %e, "failed to release lock; it will expire on its own");
        }
        match result {
            Ok(value) => Ok(LockOutcome::Acquired(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
