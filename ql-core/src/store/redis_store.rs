use super::{Batch, Command, CoordinationStore, KeyTtl, Reply, StoreResult, ttl_millis};
use crate::error::StoreError;
use ::redis::aio::ConnectionManager;
use ::redis::{RedisError, Script, Value};
use async_trait::async_trait;
use std::time::Duration;

const SCAN_COUNT: usize = 200;

const DEL_IF_PERSISTENT: &str = r#"
if redis.call('PTTL', KEYS[1]) == -1 then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            Self::Connection(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}

/// Redis-backed store. The connection manager reconnects on its own; callers
/// still see connection errors for in-flight commands and retry them.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    del_if_persistent: Script,
}

impl RedisStore {
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("invalid redis url: {e}")))?;
        let manager = client.get_connection_manager().await?;
        tracing::info!(tls = url.starts_with("rediss://"), "redis connection manager ready");
        Ok(Self {
            manager,
            del_if_persistent: Script::new(DEL_IF_PERSISTENT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn text_from_bytes(bytes: Vec<u8>) -> StoreResult<String> {
    String::from_utf8(bytes)
        .map_err(|e| StoreError::UnexpectedReply(format!("non-utf8 value: {e}")))
}

fn reply_from_value(value: Value) -> StoreResult<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Okay => Ok(Reply::Ok),
        Value::Int(n) => Ok(Reply::Int(n)),
        Value::SimpleString(s) if s == "OK" => Ok(Reply::Ok),
        Value::SimpleString(s) => Ok(Reply::Text(s)),
        Value::BulkString(bytes) => text_from_bytes(bytes).map(Reply::Text),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::BulkString(bytes) => text_from_bytes(bytes),
                Value::SimpleString(s) => Ok(s),
                other => Err(StoreError::UnexpectedReply(format!(
                    "unexpected list element: {other:?}"
                ))),
            })
            .collect::<StoreResult<Vec<_>>>()
            .map(Reply::List),
        other => Err(StoreError::UnexpectedReply(format!("{other:?}"))),
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let created: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        let len: u64 = ::redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let applied: i64 = ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn del_if_persistent(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = self
            .del_if_persistent
            .key(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            out.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut conn = self.conn();
        let millis: i64 = ::redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms if ms >= 0 => KeyTtl::Expires(Duration::from_millis(ms as u64)),
            other => {
                return Err(StoreError::UnexpectedReply(format!(
                    "PTTL returned {other}"
                )));
            }
        })
    }

    async fn exec(&self, batch: Batch) -> StoreResult<Vec<Reply>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for command in batch.into_commands() {
            match command {
                Command::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
                Command::SetEx { key, value, ttl } => {
                    pipe.cmd("SET").arg(key).arg(value).arg("PX").arg(ttl_millis(ttl));
                }
                Command::RPush { key, value } => {
                    pipe.cmd("RPUSH").arg(key).arg(value);
                }
                Command::LRange { key, start, stop } => {
                    pipe.cmd("LRANGE").arg(key).arg(start).arg(stop);
                }
                Command::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl));
                }
                Command::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                Command::LRemLast { key, value } => {
                    pipe.cmd("LREM").arg(key).arg(-1).arg(value);
                }
            }
        }
        let mut conn = self.conn();
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        values.into_iter().map(reply_from_value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_pipeline_values() {
        assert_eq!(reply_from_value(Value::Nil).expect("nil"), Reply::Nil);
        assert_eq!(reply_from_value(Value::Okay).expect("ok"), Reply::Ok);
        assert_eq!(reply_from_value(Value::Int(3)).expect("int"), Reply::Int(3));
        assert_eq!(
            reply_from_value(Value::Array(vec![
                Value::BulkString(b"Hi".to_vec()),
                Value::BulkString(b"there".to_vec()),
            ]))
            .expect("list"),
            Reply::List(vec!["Hi".to_string(), "there".to_string()])
        );
        assert_eq!(
            reply_from_value(Value::Array(vec![])).expect("empty list"),
            Reply::List(vec![])
        );
        assert!(reply_from_value(Value::BulkString(vec![0xff, 0xfe])).is_err());
    }
}
