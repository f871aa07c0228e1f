//! In-process store with the same TTL and batch semantics as the Redis backend.
//!
//! Used by tests and single-process development runs. Expiry is lazy and uses
//! `tokio::time::Instant`, so paused-clock tests observe TTLs deterministically.

use super::glob::glob_match;
use super::{Batch, Command, CoordinationStore, KeyTtl, Reply, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    injected_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with a connection error.
    /// Fault injection for retry drills.
    pub fn inject_connection_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> StoreResult<()> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Connection(
                "injected connection failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_injected_failure()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Connection("memory store mutex poisoned".to_string()))?;
        let now = Instant::now();
        f(&mut entries, now)
    }
}

fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn deadline(now: Instant, ttl: Duration, key: &str) -> StoreResult<Instant> {
    now.checked_add(ttl)
        .ok_or_else(|| StoreError::Command(format!("invalid expire time for {key}")))
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

fn lrange(items: &[String], start: i64, stop: i64) -> Vec<String> {
    let len = items.len() as i64;
    let norm = |i: i64| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    if start > stop || start >= len {
        return Vec::new();
    }
    items[start as usize..=stop as usize].to_vec()
}

fn apply(entries: &mut HashMap<String, Entry>, now: Instant, command: Command) -> StoreResult<Reply> {
    match command {
        Command::Get { key } => match live(entries, &key, now) {
            None => Ok(Reply::Nil),
            Some(Entry {
                value: Value::Text(s),
                ..
            }) => Ok(Reply::Text(s.clone())),
            Some(_) => Err(wrong_type(&key)),
        },
        Command::SetEx { key, value, ttl } => {
            let expires_at = deadline(now, ttl, &key)?;
            entries.insert(
                key,
                Entry {
                    value: Value::Text(value),
                    expires_at: Some(expires_at),
                },
            );
            Ok(Reply::Ok)
        }
        Command::RPush { key, value } => match live(entries, &key, now) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => {
                items.push(value);
                Ok(Reply::Int(items.len() as i64))
            }
            Some(_) => Err(wrong_type(&key)),
            None => {
                entries.insert(
                    key,
                    Entry {
                        value: Value::List(vec![value]),
                        expires_at: None,
                    },
                );
                Ok(Reply::Int(1))
            }
        },
        Command::LRange { key, start, stop } => match live(entries, &key, now) {
            None => Ok(Reply::List(Vec::new())),
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(Reply::List(lrange(items, start, stop))),
            Some(_) => Err(wrong_type(&key)),
        },
        Command::Expire { key, ttl } => match live(entries, &key, now) {
            Some(entry) => {
                entry.expires_at = Some(deadline(now, ttl, &key)?);
                Ok(Reply::Int(1))
            }
            None => Ok(Reply::Int(0)),
        },
        Command::Del { key } => {
            let existed = live(entries, &key, now).is_some();
            entries.remove(&key);
            Ok(Reply::Int(i64::from(existed)))
        }
        Command::LRemLast { key, value } => {
            let emptied = match live(entries, &key, now) {
                None => return Ok(Reply::Int(0)),
                Some(Entry {
                    value: Value::List(items),
                    ..
                }) => match items.iter().rposition(|item| *item == value) {
                    Some(index) => {
                        items.remove(index);
                        items.is_empty()
                    }
                    None => return Ok(Reply::Int(0)),
                },
                Some(_) => return Err(wrong_type(&key)),
            };
            // Empty lists do not exist.
            if emptied {
                entries.remove(&key);
            }
            Ok(Reply::Int(1))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.with_entries(|_, _| Ok(()))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_entries(|entries, now| {
            apply(
                entries,
                now,
                Command::Get {
                    key: key.to_string(),
                },
            )?
            .into_text()
        })
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_entries(|entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: None,
                },
            );
            Ok(())
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.with_entries(|entries, now| {
            apply(
                entries,
                now,
                Command::SetEx {
                    key: key.to_string(),
                    value: value.to_string(),
                    ttl,
                },
            )
            .map(|_| ())
        })
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_entries(|entries, now| {
            if live(entries, key, now).is_some() {
                return Ok(false);
            }
            let expires_at = deadline(now, ttl, key)?;
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: Some(expires_at),
                },
            );
            Ok(true)
        })
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.with_entries(|entries, now| {
            let len = apply(
                entries,
                now,
                Command::RPush {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            )?
            .into_int()?;
            Ok(len as u64)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_entries(|entries, now| {
            let n = apply(
                entries,
                now,
                Command::Expire {
                    key: key.to_string(),
                    ttl,
                },
            )?
            .into_int()?;
            Ok(n == 1)
        })
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.with_entries(|entries, now| {
            let n = apply(
                entries,
                now,
                Command::Del {
                    key: key.to_string(),
                },
            )?
            .into_int()?;
            Ok(n == 1)
        })
    }

    async fn del_if_persistent(&self, key: &str) -> StoreResult<bool> {
        self.with_entries(|entries, now| {
            let persistent = live(entries, key, now).is_some_and(|e| e.expires_at.is_none());
            if persistent {
                entries.remove(key);
            }
            Ok(persistent)
        })
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.with_entries(|entries, now| {
            let mut out: Vec<String> = entries
                .iter()
                .filter(|(k, e)| e.is_live(now) && glob_match(pattern, k))
                .map(|(k, _)| k.clone())
                .collect();
            out.sort();
            Ok(out)
        })
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        self.with_entries(|entries, now| {
            Ok(match live(entries, key, now) {
                None => KeyTtl::Missing,
                Some(Entry {
                    expires_at: None, ..
                }) => KeyTtl::Persistent,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => KeyTtl::Expires(at.saturating_duration_since(now)),
            })
        })
    }

    async fn exec(&self, batch: Batch) -> StoreResult<Vec<Reply>> {
        self.with_entries(|entries, now| {
            // Stage touched keys so a failing command leaves the store untouched.
            let commands = batch.into_commands();
            let mut staged: HashMap<String, Entry> = HashMap::new();
            for command in &commands {
                let key = command_key(command);
                if let Some(entry) = live(entries, key, now) {
                    staged.insert(key.to_string(), entry.clone());
                }
            }
            let mut touched: Vec<String> =
                commands.iter().map(|c| command_key(c).to_string()).collect();
            touched.sort();
            touched.dedup();

            let mut replies = Vec::with_capacity(commands.len());
            for command in commands {
                replies.push(apply(&mut staged, now, command)?);
            }

            for key in touched {
                match staged.remove(&key) {
                    Some(entry) => {
                        entries.insert(key, entry);
                    }
                    None => {
                        entries.remove(&key);
                    }
                }
            }
            Ok(replies)
        })
    }
}

fn command_key(command: &Command) -> &str {
    match command {
        Command::Get { key }
        | Command::SetEx { key, .. }
        | Command::RPush { key, .. }
        | Command::LRange { key, .. }
        | Command::Expire { key, .. }
        | Command::Del { key }
        | Command::LRemLast { key, .. } => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(10))
            .await
            .expect("set_ex");
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("k").await.expect("get"), Some("v".to_string()));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.expect("get"), None);
        assert_eq!(store.ttl("k").await.expect("ttl"), KeyTtl::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_ex_only_succeeds_once_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.set_nx_ex("lock", "locked", ttl).await.expect("first"));
        assert!(!store.set_nx_ex("lock", "locked", ttl).await.expect("second"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_nx_ex("lock", "locked", ttl).await.expect("after expiry"));
    }

    #[tokio::test]
    async fn ttl_distinguishes_persistent_and_expiring_keys() {
        let store = MemoryStore::new();
        store.set("plain", "v").await.expect("set");
        store
            .set_ex("timed", "v", Duration::from_secs(30))
            .await
            .expect("set_ex");
        assert_eq!(store.ttl("plain").await.expect("ttl"), KeyTtl::Persistent);
        assert!(matches!(
            store.ttl("timed").await.expect("ttl"),
            KeyTtl::Expires(d) if d <= Duration::from_secs(30) && d > Duration::from_secs(29)
        ));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.set("text", "v").await.expect("set");
        let err = store
            .exec(Batch::new().rpush("list", "a").rpush("text", "b"))
            .await
            .expect_err("wrong type should fail the batch");
        assert!(matches!(err, StoreError::Command(_)));
        assert_eq!(store.ttl("list").await.expect("ttl"), KeyTtl::Missing);

        let replies = store
            .exec(
                Batch::new()
                    .rpush("list", "a")
                    .rpush("list", "b")
                    .lrange("list", 0, -1)
                    .del("list"),
            )
            .await
            .expect("batch");
        assert_eq!(
            replies,
            vec![
                Reply::Int(1),
                Reply::Int(2),
                Reply::List(vec!["a".to_string(), "b".to_string()]),
                Reply::Int(1),
            ]
        );
        assert_eq!(store.ttl("list").await.expect("ttl"), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn batch_touching_one_key_twice_keeps_it() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        store
            .exec(Batch::new().rpush("buf", "a").expire("buf", ttl))
            .await
            .expect("first append");
        let replies = store
            .exec(Batch::new().rpush("buf", "b").expire("buf", ttl))
            .await
            .expect("second append");
        assert_eq!(replies[0], Reply::Int(2));
        assert!(matches!(store.ttl("buf").await.expect("ttl"), KeyTtl::Expires(_)));
        let replies = store
            .exec(Batch::new().lrange("buf", 0, -1))
            .await
            .expect("lrange");
        assert_eq!(
            replies,
            vec![Reply::List(vec!["a".to_string(), "b".to_string()])]
        );
    }

    #[tokio::test]
    async fn interleaved_appends_and_drains_keep_every_fragment_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        let append = |text: &'static str| Batch::new().rpush("buf", text).expire("buf", ttl);
        let drain = || Batch::new().lrange("buf", 0, -1).del("buf").del("handle");

        let mut seen = Vec::new();
        for text in ["a", "b"] {
            store.exec(append(text)).await.expect("append");
        }
        store.set("handle", "job-1").await.expect("set handle");
        let replies = store.exec(drain()).await.expect("drain");
        seen.extend(replies[0].clone().into_list().expect("list"));
        assert_eq!(store.get("handle").await.expect("get"), None);

        store.exec(append("c")).await.expect("append");
        let replies = store.exec(drain()).await.expect("drain");
        seen.extend(replies[0].clone().into_list().expect("list"));

        let replies = store.exec(drain()).await.expect("empty drain");
        assert!(replies[0].clone().into_list().expect("list").is_empty());
        assert_eq!(seen, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_an_error_not_a_panic() {
        let store = MemoryStore::new();
        let err = store
            .set_ex("k", "v", Duration::MAX)
            .await
            .expect_err("ttl out of range");
        assert!(matches!(err, StoreError::Command(_)));
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn lrem_last_removes_only_the_newest_match() {
        let store = MemoryStore::new();
        store
            .exec(Batch::new().rpush("buf", "x").rpush("buf", "y").rpush("buf", "x"))
            .await
            .expect("push");
        let replies = store
            .exec(Batch::new().lrem_last("buf", "x").lrem_last("buf", "zz").lrange("buf", 0, -1))
            .await
            .expect("lrem");
        assert_eq!(
            replies,
            vec![
                Reply::Int(1),
                Reply::Int(0),
                Reply::List(vec!["x".to_string(), "y".to_string()]),
            ]
        );

        store
            .exec(Batch::new().lrem_last("buf", "x").lrem_last("buf", "y"))
            .await
            .expect("lrem");
        assert_eq!(store.ttl("buf").await.expect("ttl"), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn del_if_persistent_spares_expiring_keys() {
        let store = MemoryStore::new();
        store.set("stale", "locked").await.expect("set");
        store
            .set_ex("held", "locked", Duration::from_secs(10))
            .await
            .expect("set_ex");
        assert!(store.del_if_persistent("stale").await.expect("del stale"));
        assert!(!store.del_if_persistent("held").await.expect("del held"));
        assert!(!store.del_if_persistent("missing").await.expect("del missing"));
        assert_eq!(store.keys("*").await.expect("keys"), vec!["held".to_string()]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.inject_connection_failures(2);
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());
    }

    #[test]
    fn lrange_handles_negative_and_out_of_range_indexes() {
        let items: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(lrange(&items, 0, -1), items);
        assert_eq!(lrange(&items, -2, -1), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(lrange(&items, 5, 10), Vec::<String>::new());
        assert_eq!(lrange(&[], 0, -1), Vec::<String>::new());
    }
}
