//! The embedded relational store and shared database plumbing.

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio::time::sleep;

use crate::errors::{Error, Result};

pub mod targets;

/// Attempts made by [`retry`] before a transient conflict is surfaced.
const TX_RETRY_ATTEMPTS: u32 = 5;
const TX_RETRY_BASE_MS: u64 = 10;
const TX_RETRY_MAX_MS: u64 = 1_000;

/// Handle to the embedded SQLite store. Cheap to clone; all clones share one
/// pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (creating if missing) the store at the given path and run
    /// pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        const OP: &str = "store.open";
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory store. A single connection keeps the database alive
    /// for the lifetime of the pool.
    pub async fn open_in_memory() -> Result<Self> {
        const OP: &str = "store.open_in_memory";
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::from_sqlx(OP, e))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| Error::from_sqlx(OP, e))?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        const OP: &str = "store.migrate";
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::internal(OP, e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Run a database operation, retrying transient conflicts with exponential
/// backoff and jitter. The closure is re-invoked from scratch on each
/// attempt, so it must begin and commit its own transaction.
pub async fn retry<T, F, Fut>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < TX_RETRY_ATTEMPTS => {
                let backoff = (TX_RETRY_BASE_MS << (attempt - 1)).min(TX_RETRY_MAX_MS);
                let jitter = rand::thread_rng().gen_range(0..=TX_RETRY_BASE_MS);
                tracing::debug!(op, attempt, backoff_ms = backoff, "retrying transient database conflict");
                sleep(Duration::from_millis(backoff + jitter)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Timestamps are persisted as unix milliseconds.
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(op: &'static str, ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::internal(op, format!("timestamp {ms} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn open_in_memory_runs_migrations() {
        let store = Store::open_in_memory().await.unwrap();
        let n: i64 = sqlx::query_scalar("select count(*) from cache_user")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = retry("test.op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::internal("test.op", "nope")) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let res = retry("test.op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transient { op: "test.op", source: sqlx::Error::PoolTimedOut })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(res, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc::now();
        let back = from_millis("test", to_millis(now)).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
