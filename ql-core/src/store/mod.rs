//! Shared coordination store.
//!
//! The store is the only place coordination state lives: buffers, pending job
//! handles and lock entries. Every multi-key mutation goes through [`Batch`],
//! which implementations must apply all-or-nothing.

mod glob;
mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::StoreError;
use crate::retry::{RetryPolicy, retry};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    SetEx { key: String, value: String, ttl: Duration },
    RPush { key: String, value: String },
    LRange { key: String, start: i64, stop: i64 },
    Expire { key: String, ttl: Duration },
    Del { key: String },
    /// Removes the last list element equal to `value` (LREM key -1 value).
    LRemLast { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl Reply {
    pub fn into_list(self) -> StoreResult<Vec<String>> {
        match self {
            Self::List(items) => Ok(items),
            Self::Nil => Ok(Vec::new()),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected list reply, got {other:?}"
            ))),
        }
    }

    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            Self::Int(n) => Ok(n),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected integer reply, got {other:?}"
            ))),
        }
    }

    pub fn into_text(self) -> StoreResult<Option<String>> {
        match self {
            Self::Text(s) => Ok(Some(s)),
            Self::Nil => Ok(None),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected text reply, got {other:?}"
            ))),
        }
    }
}

/// Ordered commands executed as one atomic unit. Replies come back in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(mut self, key: &str) -> Self {
        self.commands.push(Command::Get {
            key: key.to_string(),
        });
        self
    }

    pub fn set_ex(mut self, key: &str, value: &str, ttl: Duration) -> Self {
        self.commands.push(Command::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        self
    }

    pub fn rpush(mut self, key: &str, value: &str) -> Self {
        self.commands.push(Command::RPush {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn lrange(mut self, key: &str, start: i64, stop: i64) -> Self {
        self.commands.push(Command::LRange {
            key: key.to_string(),
            start,
            stop,
        });
        self
    }

    pub fn expire(mut self, key: &str, ttl: Duration) -> Self {
        self.commands.push(Command::Expire {
            key: key.to_string(),
            ttl,
        });
        self
    }

    pub fn del(mut self, key: &str) -> Self {
        self.commands.push(Command::Del {
            key: key.to_string(),
        });
        self
    }

    pub fn lrem_last(mut self, key: &str, value: &str) -> Self {
        self.commands.push(Command::LRemLast {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// The key exists but has no expiry.
    Persistent,
    Expires(Duration),
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Short backend label for logs and health output: "redis", "memory".
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Plain SET without expiry.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// SET NX with expiry. Returns whether this caller created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Appends to the list at `key` and returns its new length.
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Deletes `key` only if it currently has no expiry, as one atomic step.
    async fn del_if_persistent(&self, key: &str) -> StoreResult<bool>;

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    async fn exec(&self, batch: Batch) -> StoreResult<Vec<Reply>>;
}

/// Store operation wrapped in the bounded retry policy. Only connectivity
/// failures are retried.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, op_name: &'static str, op: F) -> StoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let result = retry(policy, op_name, op, StoreError::is_transient).await;
    if let Err(e) = &result {
        if e.is_transient() {
            tracing::warn!(
                op = op_name,
                attempts = policy.max_attempts(),
                error = %e,
                "store retries exhausted"
            );
        }
    }
    result
}

pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
