use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::log::record_exception;
use crate::prelude::*;

use super::lock::LockHandle;
use super::options::{LockOptions, RetryStrategy};
use super::registry::{Registry, Stats};
use super::renewal::RenewalService;
use super::shutdown::ShutdownCoordinator;
use super::store::Store;
use super::token::TokenAllocator;

const TOKEN_COUNTER_KEY: &str = "lynx:redis:lock:token";

/// Guarantees RELEASE is attempted on every exit from a convenience function's `fn`, including
/// a panic unwinding through it or the enclosing future being dropped mid-poll (cancellation).
/// The explicit, awaited [`Self::release`] path is the common case; [`Drop`] is the fallback for
/// exits that never reach it, mirroring a scoped/deferred-release idiom with no `defer` of its
/// own in the language.
struct ReleaseGuard {
    handle: Arc<LockHandle>,
    released: bool,
}

impl ReleaseGuard {
    fn new(handle: Arc<LockHandle>) -> Self {
        Self {
            handle,
            released: false,
        }
    }

    /// Releases the held lease and disarms the `Drop` fallback.
    async fn release(mut self) -> LockResult<()> {
        self.released = true;
        self.handle.release().await
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let handle = self.handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.release().await {
                record_exception(
                    "release on scope-exit fallback failed",
                    format!("key '{}': {:?}", handle.key(), e),
                );
            }
        });
    }
}

/// The process-wide "service context": one store adapter, one registry, one renewal service and
/// the token-key name, constructed once per process. Every handle and every convenience
/// function below binds to this context implicitly.
pub struct LockService {
    store: Store,
    token_allocator: Arc<TokenAllocator>,
    registry: Arc<Registry>,
    stats: Arc<Stats>,
    shutdown: Arc<ShutdownCoordinator>,
    renewal_service: Arc<RenewalService>,
}

impl LockService {
    /// Construct a service bound to a standalone Redis-compatible backend at `redis_url`.
    /// Cluster/sentinel client construction is an external collaborator's concern.
    pub fn new(redis_url: impl Into<String>, key_prefix: impl Into<String>) -> LockResult<Self> {
        let prefix = key_prefix.into();
        let store = Store::new(redis_url, prefix, Duration::from_secs(5))?;
        let token_allocator = Arc::new(TokenAllocator::new(store.clone(), TOKEN_COUNTER_KEY));
        let registry = Arc::new(Registry::default());
        let stats = Arc::new(Stats::default());
        let shutdown = ShutdownCoordinator::new();
        let renewal_service = RenewalService::new(registry.clone(), stats.clone(), shutdown.clone());

        Ok(Self {
            store,
            token_allocator,
            registry,
            stats,
            shutdown,
            renewal_service,
        })
    }

    /// Allocate a handle without acquiring it.
    pub fn new_lock(&self, key: impl Into<String>, options: LockOptions) -> Arc<LockHandle> {
        LockHandle::new(
            key,
            options,
            self.store.clone(),
            self.token_allocator.clone(),
            self.registry.clone(),
            self.stats.clone(),
            self.shutdown.clone(),
        )
    }

    /// Create a handle with default options, acquire with default retry, run `fn`, and release
    /// on every exit.
    pub async fn lock<T, Fut>(
        &self,
        key: impl Into<String>,
        expiration: chrono::Duration,
        f: impl FnOnce() -> Fut,
    ) -> LockResult<T>
    where
        Fut: Future<Output = LockResult<T>>,
    {
        let mut options = LockOptions::default();
        options.expiration = expiration;
        self.lock_with_options(key, options, f).await
    }

    /// Same as [`Self::lock`] with explicit [`LockOptions`].
    pub async fn lock_with_options<T, Fut>(
        &self,
        key: impl Into<String>,
        options: LockOptions,
        f: impl FnOnce() -> Fut,
    ) -> LockResult<T>
    where
        Fut: Future<Output = LockResult<T>>,
    {
        let strategy = options.retry_strategy.clone();
        let handle = self.new_lock(key, options);
        self.renewal_service.ensure_started().await;

        handle.acquire_with_retry(&strategy).await?;
        let guard = ReleaseGuard::new(handle);
        let result = f().await;
        let release_result = guard.release().await;

        match (result, release_result) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    /// Same as [`Self::lock`] with an explicit [`RetryStrategy`].
    pub async fn lock_with_retry<T, Fut>(
        &self,
        key: impl Into<String>,
        expiration: chrono::Duration,
        strategy: RetryStrategy,
        f: impl FnOnce() -> Fut,
    ) -> LockResult<T>
    where
        Fut: Future<Output = LockResult<T>>,
    {
        let mut options = LockOptions::default();
        options.expiration = expiration;
        options.retry_strategy = strategy;
        self.lock_with_options(key, options, f).await
    }

    /// Same as [`Self::lock`], but passes the fencing token assigned on first-acquire to `f`.
    pub async fn lock_with_token<T, Fut>(
        &self,
        key: impl Into<String>,
        expiration: chrono::Duration,
        f: impl FnOnce(i64) -> Fut,
    ) -> LockResult<T>
    where
        Fut: Future<Output = LockResult<T>>,
    {
        let mut options = LockOptions::default();
        options.expiration = expiration;
        let strategy = options.retry_strategy.clone();
        let handle = self.new_lock(key, options);
        self.renewal_service.ensure_started().await;

        handle.acquire_with_retry(&strategy).await?;
        let token = handle.token().await;
        let guard = ReleaseGuard::new(handle);
        let result = f(token).await;
        let release_result = guard.release().await;

        match (result, release_result) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    /// Release a record whose holder identity is supplied externally, e.g. after handing a
    /// lease off between processes. Runs RELEASE semantics directly against the store, without
    /// going through a local handle.
    pub async fn unlock_by_value(&self, key: &str, value: &str) -> LockResult<()> {
        let reply = self
            .store
            .release(key, value, self.store.default_timeout())
            .await
            .loc()?;
        if reply < 0 {
            Err(Report::new(LockErrorKind::NotHeld)
                .attach_printable(format!("key '{}' not held by the supplied value", key)))
        } else {
            self.stats.releases_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
    }

    /// Snapshot of every operational counter.
    pub fn get_stats(&self) -> std::collections::HashMap<String, f64> {
        self.stats.snapshot()
    }

    /// Engages the shutdown coordinator: new `Acquire` calls fail with `ShuttingDown`, the
    /// renewal service stops, and this call waits until `active_locks == 0` or `deadline`
    /// elapses. Never calls RELEASE on behalf of callers.
    pub async fn shutdown(&self, deadline: Duration) -> LockResult<()> {
        self.renewal_service.stop().await;

        let start = tokio::time::Instant::now();
        while self.registry.len() > 0 {
            if start.elapsed() >= deadline {
                return Err(Report::new(LockErrorKind::Cancelled).attach_printable(format!(
                    "shutdown deadline reached with {} handle(s) still active",
                    self.registry.len()
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}
