use crate::keys::KeySpace;
use crate::queue::Job;
use crate::store::{CoordinationStore, KeyTtl, StoreResult};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub scanned: usize,
    pub reaped: usize,
    pub failed: usize,
}

/// Removes lock keys that lost their expiry. Locks are always written with a
/// TTL, so a persistent one can only be a leftover that would block its user
/// forever.
#[derive(Clone)]
pub struct StaleLockReaper {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
}

impl StaleLockReaper {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// One pass over the lock family. Per-key failures are counted and the
    /// sweep moves on; only a failed listing aborts it.
    #[tracing::instrument(level = "debug", skip_all, fields(pattern = tracing::field::Empty))]
    pub async fn sweep(&self) -> StoreResult<ReapReport> {
        let pattern = self.keys.lock_pattern();
        tracing::Span::current().record("pattern", pattern.as_str());
        let keys = self.store.keys(&pattern).await?;
        let mut report = ReapReport {
            scanned: keys.len(),
            ..ReapReport::default()
        };
        for key in &keys {
            match self.reap_one(key).await {
                Ok(true) => {
                    report.reaped += 1;
                    tracing::info!(lock = %key, "deleted lock without expiry");
                }
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(lock = %key, error = %e, "failed to inspect lock");
                }
            }
        }
        if report.reaped > 0 || report.failed > 0 {
            tracing::info!(
                scanned = report.scanned,
                reaped = report.reaped,
                failed = report.failed,
                "stale lock sweep finished"
            );
        }
        Ok(report)
    }

    async fn reap_one(&self, key: &str) -> StoreResult<bool> {
        match self.store.ttl(key).await? {
            KeyTtl::Persistent => self.store.del_if_persistent(key).await,
            KeyTtl::Missing | KeyTtl::Expires(_) => Ok(false),
        }
    }
}

#[async_trait]
impl Job for StaleLockReaper {
    fn name(&self) -> &'static str {
        "stale_lock_reaper"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.sweep().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::UserId;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn deletes_only_locks_without_expiry() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySpace::new("user_bot");
        let reaper = StaleLockReaper::new(store.clone(), keys.clone());

        let stale = keys.lock(&UserId::new("1"));
        let live = keys.lock(&UserId::new("2"));
        let buffer = keys.buffer(&UserId::new("3"));
        let foreign = KeySpace::new("user_other").lock(&UserId::new("4"));
        store.set(&stale, "locked").await.expect("set");
        store
            .set_ex(&live, "locked", Duration::from_secs(10))
            .await
            .expect("set");
        store.rpush(&buffer, "hello").await.expect("rpush");
        store.set(&foreign, "locked").await.expect("set");

        let report = reaper.sweep().await.expect("sweep");
        assert_eq!(
            report,
            ReapReport {
                scanned: 2,
                reaped: 1,
                failed: 0
            }
        );
        assert_eq!(store.get(&stale).await.expect("get"), None);
        assert!(store.get(&live).await.expect("get").is_some());
        assert!(store.get(&foreign).await.expect("get").is_some());
        assert_eq!(
            store.ttl(&buffer).await.expect("ttl"),
            KeyTtl::Persistent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_store_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let reaper = StaleLockReaper::new(store, KeySpace::new("user_bot"));
        assert_eq!(reaper.sweep().await.expect("sweep"), ReapReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn listing_failure_aborts_the_sweep() {
        let store = Arc::new(MemoryStore::new());
        let reaper = StaleLockReaper::new(store.clone(), KeySpace::new("user_bot"));
        store.inject_connection_failures(1);
        assert!(reaper.sweep().await.is_err());
        assert_eq!(reaper.sweep().await.expect("sweep").scanned, 0);
    }
}
