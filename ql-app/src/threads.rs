//! Per-user assistant thread ids and conversation status, in SQLite.
//!
//! A conversation is open until it is handed to an operator; closed users are
//! ignored by the webhook.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_history (
  user_id TEXT PRIMARY KEY,
  history TEXT,
  status INTEGER NOT NULL DEFAULT 1
)
"#;

#[derive(Debug, Clone)]
pub struct ThreadStore {
    path: PathBuf,
}

impl ThreadStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("threads.db_path is required"));
        }
        let store = Self { path };
        store.with_conn(|conn| Ok(conn.execute_batch(SCHEMA)?)).await?;
        tracing::info!(path = %store.path.display(), "thread store ready");
        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("open thread store {}", path.display()))?;
            f(&conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!("thread store task join error: {e}"))?
    }

    pub async fn get(&self, user: &str) -> Result<Option<String>> {
        let user = user.to_string();
        self.with_conn(move |conn| {
            let thread: Option<Option<String>> = conn
                .query_row(
                    "SELECT history FROM conversation_history WHERE user_id = ?1",
                    params![user],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(thread.flatten())
        })
        .await
    }

    /// Upserts the thread id and leaves the conversation status alone.
    pub async fn save(&self, user: &str, thread_id: &str) -> Result<()> {
        let (user, thread_id) = (user.to_string(), thread_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversation_history (user_id, history) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET history = excluded.history",
                params![user, thread_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Missing rows count as open. Read failures are logged and also count as
    /// open so a broken database never silences the bot.
    pub async fn is_open(&self, user: &str) -> bool {
        let owned = user.to_string();
        let status = self
            .with_conn(move |conn| {
                let status: Option<i64> = conn
                    .query_row(
                        "SELECT status FROM conversation_history WHERE user_id = ?1",
                        params![owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(status)
            })
            .await;
        match status {
            Ok(status) => status.is_none_or(|s| s != 0),
            Err(e) => {
                tracing::error!(user, error = %e, "conversation status lookup failed; treating as open");
                true
            }
        }
    }

    pub async fn close(&self, user: &str) -> Result<()> {
        let user = user.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversation_history (user_id, status) VALUES (?1, 0)
                 ON CONFLICT(user_id) DO UPDATE SET status = 0",
                params![user],
            )?;
            Ok(())
        })
        .await
    }
}
