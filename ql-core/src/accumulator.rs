use crate::keys::KeySpace;
use crate::retry::RetryPolicy;
use crate::store::{Batch, CoordinationStore, StoreResult, with_retry};
use crate::types::{JobId, UserId};
use std::sync::Arc;
use std::time::Duration;

/// Per-user ordered buffer of message fragments.
///
/// Appends and drains are single atomic batches, so a fragment is either
/// returned by exactly one drain or still sitting in the buffer.
#[derive(Clone)]
pub struct MessageAccumulator {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    buffer_ttl: Duration,
    retry: RetryPolicy,
}

impl MessageAccumulator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        buffer_ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            keys,
            buffer_ttl,
            retry,
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Appends a fragment and slides the buffer's expiry forward. Returns the
    /// buffer length after the append.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %user))]
    pub async fn append(&self, user: &UserId, fragment: &str) -> StoreResult<u64> {
        let key = self.keys.buffer(user);
        let replies = with_retry(self.retry, "accumulator.append", |_| {
            let batch = Batch::new()
                .rpush(&key, fragment)
                .expire(&key, self.buffer_ttl);
            self.store.exec(batch)
        })
        .await?;
        let len = replies
            .into_iter()
            .next()
            .map(|reply| reply.into_int())
            .transpose()?
            .unwrap_or_default();
        tracing::debug!(buffered = len, "fragment appended");
        Ok(len.max(0) as u64)
    }

    /// Takes back the newest copy of `fragment`. Used when the append
    /// succeeded but nothing was scheduled to drain it.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %user))]
    pub async fn retract(&self, user: &UserId, fragment: &str) -> StoreResult<bool> {
        let key = self.keys.buffer(user);
        let replies = with_retry(self.retry, "accumulator.retract", |_| {
            self.store.exec(Batch::new().lrem_last(&key, fragment))
        })
        .await?;
        let removed = replies
            .into_iter()
            .next()
            .map(|reply| reply.into_int())
            .transpose()?
            .unwrap_or_default();
        Ok(removed > 0)
    }

    /// The job currently registered to drain this user's buffer, if any.
    pub async fn pending_job(&self, user: &UserId) -> StoreResult<Option<JobId>> {
        let handle = self.keys.pending_job(user);
        let current = with_retry(self.retry, "accumulator.pending_job", |_| {
            self.store.get(&handle)
        })
        .await?;
        Ok(current.map(JobId::new))
    }

    /// Takes every buffered fragment in arrival order and clears both the
    /// buffer and the pending job handle in the same atomic step.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %user))]
    pub async fn drain(&self, user: &UserId) -> StoreResult<Vec<String>> {
        let buffer = self.keys.buffer(user);
        let handle = self.keys.pending_job(user);
        let replies = with_retry(self.retry, "accumulator.drain", |_| {
            let batch = Batch::new()
                .lrange(&buffer, 0, -1)
                .del(&buffer)
                .del(&handle);
            self.store.exec(batch)
        })
        .await?;
        let fragments = match replies.into_iter().next() {
            Some(reply) => reply.into_list()?,
            None => Vec::new(),
        };
        tracing::debug!(fragments = fragments.len(), "buffer drained");
        Ok(fragments)
    }
}
