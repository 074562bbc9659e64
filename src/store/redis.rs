//! Redis window store.
//!
//! Transactions use `WATCH` / `MULTI` / `EXEC`. `WATCH` state belongs to a
//! connection, so every transaction checks a connection out of the pool and
//! keeps it to itself until the transaction is dropped.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use tracing::{debug, info};

use super::parse_count;
use crate::config::RedisConfig;
use crate::error::{Result, WindowError};
use crate::ratelimit::{Store, Transaction, Ttl};

/// Redis-backed window store.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
}

impl RedisStore {
    /// Build a connection pool and check that the server answers.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::StoreUnavailable`] if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        debug!(url = %config.url, "Connecting to Redis");

        let manager = RedisConnectionManager::new(config.url.as_str())?;
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connection_timeout())
            .build(manager)
            .await?;

        let store = Self::from_pool(pool);
        store.ping().await?;

        info!(
            url = %config.url,
            pool_size = config.pool_size,
            "Redis window store ready"
        );
        Ok(store)
    }

    /// Use an existing pool.
    pub fn from_pool(pool: Pool<RedisConnectionManager>) -> Self {
        Self { pool }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("state", &self.pool.state())
            .finish()
    }
}

fn pool_error(err: bb8::RunError<redis::RedisError>) -> WindowError {
    match err {
        bb8::RunError::User(err) => err.into(),
        bb8::RunError::TimedOut => {
            WindowError::StoreUnavailable("timed out waiting for a connection".to_string())
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Store for RedisStore {
    type Transaction = RedisTransaction;

    async fn watch(&self, key: &str) -> Result<RedisTransaction> {
        let mut conn = self.pool.get_owned().await.map_err(pool_error)?;

        // Clear anything a previous, interrupted transaction left watched.
        let _: () = redis::pipe()
            .cmd("UNWATCH")
            .ignore()
            .cmd("WATCH")
            .arg(key)
            .ignore()
            .query_async(&mut *conn)
            .await?;

        Ok(RedisTransaction {
            conn,
            key: key.to_owned(),
        })
    }
}

/// A watched scope over one Redis key, holding its own pooled connection.
pub struct RedisTransaction {
    conn: PooledConnection<'static, RedisConnectionManager>,
    key: String,
}

#[async_trait]
impl Transaction for RedisTransaction {
    fn key(&self) -> &str {
        &self.key
    }

    async fn get(&mut self) -> Result<Option<i64>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut *self.conn)
            .await?;
        value.as_deref().map(parse_count).transpose()
    }

    async fn set_if_absent(&mut self, value: i64, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut *self.conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn increment(&mut self) -> Result<i64> {
        let count: i64 = redis::cmd("INCR")
            .arg(&self.key)
            .query_async(&mut *self.conn)
            .await?;
        Ok(count)
    }

    async fn remaining_ttl(&mut self) -> Result<Ttl> {
        let raw: i64 = redis::cmd("PTTL")
            .arg(&self.key)
            .query_async(&mut *self.conn)
            .await?;
        Ok(Ttl::from_millis(raw))
    }

    async fn expire(&mut self, ttl: Duration) -> Result<bool> {
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(&self.key)
            .arg(millis(ttl))
            .query_async(&mut *self.conn)
            .await?;
        Ok(applied == 1)
    }

    async fn delete(&mut self) -> Result<u64> {
        let removed: u64 = redis::cmd("DEL")
            .arg(&self.key)
            .query_async(&mut *self.conn)
            .await?;
        Ok(removed)
    }

    async fn increment_and_ttl(&mut self) -> Result<(i64, Ttl)> {
        // A nil EXEC reply means the watched key changed.
        let reply: Option<(i64, i64)> = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&self.key)
            .cmd("PTTL")
            .arg(&self.key)
            .query_async(&mut *self.conn)
            .await?;

        let (count, ttl) = reply.ok_or(WindowError::OptimisticConflict)?;
        Ok((count, Ttl::from_millis(ttl)))
    }

    async fn get_and_ttl(&mut self) -> Result<(Option<i64>, Ttl)> {
        let reply: Option<(Option<String>, i64)> = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(&self.key)
            .cmd("PTTL")
            .arg(&self.key)
            .query_async(&mut *self.conn)
            .await?;

        let (value, ttl) = reply.ok_or(WindowError::OptimisticConflict)?;
        let count = value.as_deref().map(parse_count).transpose()?;
        Ok((count, Ttl::from_millis(ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(60);

    /// Connect to the server named by `RATEWINDOW_REDIS_URL`.
    async fn connect() -> RedisStore {
        let url = std::env::var("RATEWINDOW_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let config = RedisConfig {
            url,
            ..RedisConfig::default()
        };
        RedisStore::connect(&config).await.unwrap()
    }

    fn unique_key(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("ratewindow-test:{}:{}", name, nanos)
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_primitives() {
        let store = connect().await;
        let key = unique_key("primitives");
        let mut tx = store.watch(&key).await.unwrap();

        assert!(tx.set_if_absent(1, PERIOD).await.unwrap());
        assert!(!tx.set_if_absent(1, PERIOD).await.unwrap());
        assert_eq!(tx.get().await.unwrap(), Some(1));
        assert!(matches!(tx.remaining_ttl().await.unwrap(), Ttl::Remaining(_)));
        assert_eq!(tx.delete().await.unwrap(), 1);

        assert_eq!(tx.increment().await.unwrap(), 1);
        assert_eq!(tx.remaining_ttl().await.unwrap(), Ttl::NoExpiry);
        assert!(tx.expire(PERIOD).await.unwrap());
        assert_eq!(tx.delete().await.unwrap(), 1);
        assert!(!tx.expire(PERIOD).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_watch_conflict() {
        let store = connect().await;
        let key = unique_key("conflict");

        let mut setup = store.watch(&key).await.unwrap();
        assert!(setup.set_if_absent(1, PERIOD).await.unwrap());

        let mut watcher = store.watch(&key).await.unwrap();
        let mut other = store.watch(&key).await.unwrap();
        assert_eq!(other.increment().await.unwrap(), 2);

        let err = watcher.increment_and_ttl().await.unwrap_err();
        assert!(err.is_conflict());

        let mut fresh = store.watch(&key).await.unwrap();
        let (count, ttl) = fresh.increment_and_ttl().await.unwrap();
        assert_eq!(count, 3);
        assert!(matches!(ttl, Ttl::Remaining(_)));
        assert_eq!(fresh.delete().await.unwrap(), 1);
    }
}
