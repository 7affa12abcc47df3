use std::time::Duration;

use deadpool_redis::{
    redis::{AsyncCommands, FromRedisValue},
    Config, Runtime,
};

use crate::errors::prelude::*;

use super::scripts;

/// Executes the four lock scripts atomically against a Redis-compatible backend.
///
/// Cheap to clone: the underlying `deadpool_redis::Pool` is itself reference-counted.
#[derive(Clone)]
pub struct Store {
    pool: deadpool_redis::Pool,
    prefix: String,
    default_script_timeout: Duration,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("prefix", &self.prefix)
            .field("default_script_timeout", &self.default_script_timeout)
            .finish()
    }
}

impl Store {
    /// Build a store from a Redis URL (e.g. `redis://127.0.0.1`). Only standalone connection
    /// strings are handled here; cluster/sentinel client construction is a concern for the
    /// embedding application, not this crate.
    /// `default_script_timeout` bounds calls that aren't made on behalf of a specific handle
    /// (`IsLocked`, `NextToken`, `Ping`); handle-bound calls (`Acquire`/`Renew`/`Release`) are
    /// bounded by that handle's own `LockOptions::script_call_timeout` instead.
    pub fn new(
        redis_url: impl Into<String>,
        prefix: impl Into<String>,
        default_script_timeout: Duration,
    ) -> LockResult<Self> {
        let cfg = Config::from_url(redis_url.into());
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .change_context(LockErrorKind::InvalidArgument)
            .attach_printable("building redis connection pool")?;
        Ok(Self {
            pool,
            prefix: prefix.into(),
            default_script_timeout,
        })
    }

    /// Prefix a bare name with this store's namespace, e.g. a lock key or the token counter key.
    pub(crate) fn namespaced(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    /// This store's default script timeout, used by calls not bound to a specific handle's
    /// own `LockOptions::script_call_timeout` (e.g. `unlock_by_value`).
    pub(crate) fn default_timeout(&self) -> Duration {
        self.default_script_timeout
    }

    fn reentry_key(key: &str) -> String {
        format!("{}:reentry", key)
    }

    async fn conn(&self) -> LockResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .change_context(LockErrorKind::Unavailable)
            .attach_printable("getting pooled redis connection")
    }

    /// Runs ACQUIRE, bounded by `timeout` (the calling handle's `LockOptions::script_call_timeout`).
    /// `key` is namespaced by this store's prefix before use; see the script library for the
    /// exact return-code contract.
    pub(crate) async fn acquire(
        &self,
        key: &str,
        value: &str,
        ttl_ms: i64,
        timeout: Duration,
    ) -> LockResult<i64> {
        let key = self.namespaced(key);
        let reentry_key = Self::reentry_key(&key);
        let mut conn = self.conn().await?;
        scripts::ACQUIRE
            .run(&mut conn, timeout, |inv| {
                inv.key(key).key(reentry_key).arg(value).arg(ttl_ms);
            })
            .await
    }

    /// Runs RENEW, bounded by `timeout`.
    pub(crate) async fn renew(
        &self,
        key: &str,
        value: &str,
        ttl_ms: i64,
        timeout: Duration,
    ) -> LockResult<i64> {
        let key = self.namespaced(key);
        let reentry_key = Self::reentry_key(&key);
        let mut conn = self.conn().await?;
        scripts::RENEW
            .run(&mut conn, timeout, |inv| {
                inv.key(key).key(reentry_key).arg(value).arg(ttl_ms);
            })
            .await
    }

    /// Runs RELEASE, bounded by `timeout`.
    pub(crate) async fn release(&self, key: &str, value: &str, timeout: Duration) -> LockResult<i64> {
        let key = self.namespaced(key);
        let reentry_key = Self::reentry_key(&key);
        let mut conn = self.conn().await?;
        scripts::RELEASE
            .run(&mut conn, timeout, |inv| {
                inv.key(key).key(reentry_key).arg(value);
            })
            .await
    }

    /// Runs COUNTER against `counter_key`, namespaced by this store's prefix, bounded by this
    /// store's default timeout (token allocation isn't bound to any one handle's options).
    pub(crate) async fn next_token(&self, counter_key: &str) -> LockResult<i64> {
        let counter_key = self.namespaced(counter_key);
        let mut conn = self.conn().await?;
        scripts::COUNTER
            .run(&mut conn, self.default_script_timeout, |inv| {
                inv.key(counter_key);
            })
            .await
    }

    /// Reads `store[key]` and compares it against `value`. Advisory only: races with expiry.
    pub(crate) async fn is_locked(&self, key: &str, value: &str) -> LockResult<bool> {
        let key = self.namespaced(key);
        let mut conn = self.conn().await?;
        let stored: Option<String> = redis_get(&mut conn, &key).await?;
        Ok(stored.as_deref() == Some(value))
    }

    /// True if the backend responds to `PING`. Used by test setup to wait for readiness.
    pub async fn ping(&self) -> bool {
        match self.pool.get().await {
            Ok(mut conn) => deadpool_redis::redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }
}

async fn redis_get<T: FromRedisValue>(
    conn: &mut deadpool_redis::Connection,
    key: &str,
) -> LockResult<T> {
    conn.get(key)
        .await
        .change_context(LockErrorKind::Unavailable)
        .attach_printable("GET failed")
}
