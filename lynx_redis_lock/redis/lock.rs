use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use rand::RngCore;
use tokio::sync::Mutex;

use crate::log::record_exception;
use crate::misc::{cancelled, is_cancelled, CancelToken, Retry};
use crate::prelude::*;

use super::options::{LockOptions, RetryStrategy};
use super::registry::{Registry, Stats};
use super::shutdown::ShutdownCoordinator;
use super::store::Store;
use super::token::TokenAllocator;

/// Where a handle sits in its lifecycle. See the module docs for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Never successfully acquired.
    Idle,
    /// Currently holds the lease (`reentry > 0`).
    Held,
    /// Terminal: fully released, or the lease was lost. Must not be reused.
    Released,
}

struct Inner {
    state: HandleState,
    token: i64,
    reentry: i64,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    held_since: Option<chrono::DateTime<chrono::Utc>>,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A single `(key, holder-id)` lock handle.
///
/// Wrapped in `Arc` so the same handle can be shared between the caller, the registry and the
/// renewal service without back-pointers: the service only ever reaches a handle through a
/// [`Registry`] snapshot.
pub struct LockHandle {
    id: u64,
    key: String,
    value: String,
    options: LockOptions,
    store: Store,
    token_allocator: Arc<TokenAllocator>,
    registry: Arc<Registry>,
    stats: Arc<Stats>,
    shutdown: Arc<ShutdownCoordinator>,
    self_ref: Weak<LockHandle>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl LockHandle {
    pub(crate) fn new(
        key: impl Into<String>,
        options: LockOptions,
        store: Store,
        token_allocator: Arc<TokenAllocator>,
        registry: Arc<Registry>,
        stats: Arc<Stats>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Arc<Self> {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|self_ref| LockHandle {
            id,
            key: key.into(),
            value: generate_holder_value(),
            options,
            store,
            token_allocator,
            registry,
            stats,
            shutdown,
            self_ref: self_ref.clone(),
            inner: Mutex::new(Inner {
                state: HandleState::Idle,
                token: 0,
                reentry: 0,
                expires_at: None,
                held_since: None,
            }),
        })
    }

    /// Process-unique identity used as the registry key.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn renewal_config(&self) -> &super::options::RenewalConfig {
        &self.options.renewal_config
    }

    pub(crate) fn worker_pool_size(&self) -> usize {
        self.options.worker_pool_size
    }

    /// The key this handle locks. Immutable after construction.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease duration granted by each `Acquire`/`Renew`.
    pub fn expiration(&self) -> chrono::Duration {
        self.options.expiration
    }

    /// The fencing token assigned on first acquire, or `0` if never acquired.
    pub async fn token(&self) -> i64 {
        self.inner.lock().await.token
    }

    /// When the current lease expires if not renewed, or `None` if never held.
    pub async fn expires_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner.lock().await.expires_at
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> HandleState {
        self.inner.lock().await.state
    }

    /// Runs ACQUIRE once, with no cancellation context. Shorthand for
    /// `acquire_cancellable(None)`.
    pub async fn acquire(&self) -> LockResult<()> {
        self.acquire_cancellable(None).await
    }

    /// Runs ACQUIRE once. Fails with `Contended` if another holder has the key, `ShuttingDown`
    /// if the service's shutdown coordinator has already engaged, `Cancelled` if `cancel`
    /// reports cancellation before the call completes.
    pub async fn acquire_cancellable(&self, mut cancel: Option<CancelToken>) -> LockResult<()> {
        if self.shutdown.is_shutting_down() {
            return Err(Report::new(LockErrorKind::ShuttingDown)
                .attach_printable(format!("key '{}'", self.key)));
        }
        if is_cancelled(&cancel) {
            return Err(self.cancelled_report());
        }
        if self.options.expiration <= chrono::Duration::zero() {
            return Err(Report::new(LockErrorKind::InvalidArgument)
                .attach_printable("expiration must be positive"));
        }

        let mut inner = self.inner.lock().await;
        if inner.state == HandleState::Released {
            return Err(Report::new(LockErrorKind::NotHeld)
                .attach_printable("handle already released, must not be reused"));
        }
        if inner.state == HandleState::Held && inner.reentry >= self.options.max_reentry {
            return Err(Report::new(LockErrorKind::InvalidArgument)
                .attach_printable("reentry ceiling reached"));
        }

        let ttl_ms = self.options.expiration.num_milliseconds();
        let reply = race_cancel(
            &mut cancel,
            self.store
                .acquire(&self.key, &self.value, ttl_ms, self.options.script_call_timeout),
        )
        .await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.stats.record_error(*e.current_context());
                return Err(e);
            }
        };

        match reply {
            1 => {
                let token = self.token_allocator.next_token().await.map_err(|e| {
                    self.stats.record_error(*e.current_context());
                    e
                })?;
                let now = chrono::Utc::now();
                inner.state = HandleState::Held;
                inner.token = token;
                inner.reentry = 1;
                inner.expires_at = Some(now + self.options.expiration);
                inner.held_since = Some(now);
                drop(inner);

                self.stats.total_locks.fetch_add(1, Ordering::Relaxed);
                self.stats.active_locks.fetch_add(1, Ordering::Relaxed);
                self.stats.acquisitions_total.fetch_add(1, Ordering::Relaxed);
                if let Some(strong) = self.self_ref.upgrade() {
                    self.registry.insert(self.id, strong);
                }
                Ok(())
            }
            2 => {
                inner.reentry += 1;
                inner.expires_at = Some(chrono::Utc::now() + self.options.expiration);
                drop(inner);
                self.stats.acquisitions_total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            0 => {
                self.stats.record_error(LockErrorKind::Contended);
                Err(Report::new(LockErrorKind::Contended)
                    .attach_printable(format!("key '{}' held by another holder", self.key)))
            }
            other => {
                record_exception(
                    "ACQUIRE returned an unexpected reply",
                    format!("key '{}', reply {}", self.key, other),
                );
                self.stats.record_error(LockErrorKind::Contended);
                Err(Report::new(LockErrorKind::Contended)
                    .attach_printable(format!("key '{}' unexpected script reply", self.key)))
            }
        }
    }

    /// Retries `acquire` under `strategy`, with no cancellation context. Shorthand for
    /// `acquire_with_retry_cancellable(strategy, None)`.
    pub async fn acquire_with_retry(&self, strategy: &RetryStrategy) -> LockResult<()> {
        self.acquire_with_retry_cancellable(strategy, None).await
    }

    /// Retries `acquire` under `strategy`, only for `Contended`/`Unavailable` failures.
    /// `cancel`, if set, preempts both the in-flight attempt and the inter-attempt sleep.
    pub async fn acquire_with_retry_cancellable(
        &self,
        strategy: &RetryStrategy,
        cancel: Option<CancelToken>,
    ) -> LockResult<()> {
        let start = chrono::Utc::now();
        // `Retry::until` is a single field each `until_*` setter overwrites, so only one of the
        // two bounds in §4.E can be expressed that way. `MaxElapsedTime` is encoded via
        // `until_total_delay`; `MaxRetries` is enforced below in `on_retry` by counting attempts,
        // so both bounds apply (the retry stops on whichever is hit first).
        let max_attempts = strategy.max_retries + 1;
        let mut retry = Retry::<Report<LockErrorKind>>::exponential_capped(
            strategy.retry_delay,
            strategy.multiplier,
            strategy.max_interval,
        )
        .until_total_delay(strategy.max_elapsed_time);
        if strategy.jitter {
            retry = retry.with_jitter();
        }
        if let Some(cancel) = cancel.clone() {
            let key = self.key.clone();
            retry = retry.cancellable(cancel, move || {
                Report::new(LockErrorKind::Cancelled).attach_printable(format!("key '{}'", key))
            });
        }

        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result = retry
            .on_retry(|info| {
                if !info.last_error.current_context().is_retryable() {
                    return Some(info.last_error);
                }
                if info.last_attempt_no >= max_attempts {
                    return Some(info.last_error);
                }
                self.stats.retries_total.fetch_add(1, Ordering::Relaxed);
                None
            })
            .call(|| async {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.acquire_cancellable(cancel.clone()).await
            })
            .await;

        self.stats
            .record_retry_duration(chrono::Utc::now() - start);

        result.map_err(|e| {
            if e.current_context().is_retryable() {
                self.stats.retry_failures_total.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(LockErrorKind::RetriesExhausted);
                Report::new(LockErrorKind::RetriesExhausted)
                    .attach_printable(format!("key '{}'", self.key))
            } else {
                e
            }
        })
    }

    /// Runs RENEW with no cancellation context. Shorthand for `renew_cancellable(new_ttl, None)`.
    pub async fn renew(&self, new_ttl: Option<chrono::Duration>) -> LockResult<()> {
        self.renew_cancellable(new_ttl, None).await
    }

    /// Runs RENEW. `new_ttl` defaults to [`Self::expiration`].
    pub async fn renew_cancellable(
        &self,
        new_ttl: Option<chrono::Duration>,
        mut cancel: Option<CancelToken>,
    ) -> LockResult<()> {
        if is_cancelled(&cancel) {
            return Err(self.cancelled_report());
        }

        let mut inner = self.inner.lock().await;
        if inner.state != HandleState::Held {
            self.stats.record_error(LockErrorKind::NotHeld);
            return Err(Report::new(LockErrorKind::NotHeld)
                .attach_printable(format!("key '{}' is not held by this handle", self.key)));
        }

        let ttl = new_ttl.unwrap_or(self.options.expiration);
        if ttl <= chrono::Duration::zero() {
            self.stats.record_error(LockErrorKind::InvalidArgument);
            return Err(Report::new(LockErrorKind::InvalidArgument)
                .attach_printable("ttl must be positive"));
        }

        let reply = race_cancel(
            &mut cancel,
            self.store
                .renew(&self.key, &self.value, ttl.num_milliseconds(), self.options.script_call_timeout),
        )
        .await
        .map_err(|e| {
            self.stats.record_error(*e.current_context());
            e
        })?;

        if reply == 1 {
            inner.expires_at = Some(chrono::Utc::now() + ttl);
            Ok(())
        } else {
            inner.state = HandleState::Released;
            let held_since = inner.held_since.take();
            drop(inner);
            self.deregister(held_since);
            self.stats.expirations_total.fetch_add(1, Ordering::Relaxed);
            self.stats.record_error(LockErrorKind::LeaseLost);
            Err(Report::new(LockErrorKind::LeaseLost)
                .attach_printable(format!("key '{}' renew observed lease loss", self.key)))
        }
    }

    /// Runs RELEASE with no cancellation context. Shorthand for `release_cancellable(None)`.
    pub async fn release(&self) -> LockResult<()> {
        self.release_cancellable(None).await
    }

    /// Runs RELEASE. Attempted even if local state looks stale; the server is authoritative.
    pub async fn release_cancellable(&self, mut cancel: Option<CancelToken>) -> LockResult<()> {
        if is_cancelled(&cancel) {
            return Err(self.cancelled_report());
        }

        let mut inner = self.inner.lock().await;
        if inner.state == HandleState::Released {
            self.stats.record_error(LockErrorKind::NotHeld);
            return Err(Report::new(LockErrorKind::NotHeld)
                .attach_printable("handle already released"));
        }

        let reply = race_cancel(
            &mut cancel,
            self.store
                .release(&self.key, &self.value, self.options.script_call_timeout),
        )
        .await
        .map_err(|e| {
            self.stats.record_error(*e.current_context());
            e
        })?;

        if reply < 0 {
            self.stats.record_error(LockErrorKind::NotHeld);
            return Err(Report::new(LockErrorKind::NotHeld)
                .attach_printable(format!("key '{}' not held by this handle", self.key)));
        }

        self.stats.releases_total.fetch_add(1, Ordering::Relaxed);
        if reply > 0 {
            inner.reentry = reply;
            Ok(())
        } else {
            inner.state = HandleState::Released;
            inner.reentry = 0;
            let held_since = inner.held_since.take();
            drop(inner);
            self.deregister(held_since);
            Ok(())
        }
    }

    /// Reads `store[key]` and compares against this handle's value, with no cancellation
    /// context. Shorthand for `is_locked_cancellable(None)`.
    pub async fn is_locked(&self) -> LockResult<bool> {
        self.is_locked_cancellable(None).await
    }

    /// Reads `store[key]` and compares against this handle's value. Purely advisory.
    pub async fn is_locked_cancellable(&self, mut cancel: Option<CancelToken>) -> LockResult<bool> {
        if is_cancelled(&cancel) {
            return Err(self.cancelled_report());
        }
        race_cancel(&mut cancel, self.store.is_locked(&self.key, &self.value)).await
    }

    fn cancelled_report(&self) -> Report<LockErrorKind> {
        self.stats.record_error(LockErrorKind::Cancelled);
        Report::new(LockErrorKind::Cancelled).attach_printable(format!("key '{}'", self.key))
    }

    fn deregister(&self, held_since: Option<chrono::DateTime<chrono::Utc>>) {
        self.registry.remove(self.id);
        self.stats.active_locks.fetch_sub(1, Ordering::Relaxed);
        if let Some(held_since) = held_since {
            self.stats
                .record_hold_duration(chrono::Utc::now() - held_since);
        }
    }

    /// Used only by the renewal service: renews if due, otherwise leaves the handle untouched.
    /// Returns `Ok(true)` if a renewal was attempted (regardless of outcome), `Ok(false)` if
    /// skipped as not due.
    pub(crate) async fn renew_if_due(&self) -> LockResult<bool> {
        let (state, expires_at) = {
            let inner = self.inner.lock().await;
            (inner.state, inner.expires_at)
        };
        if state != HandleState::Held || !self.options.renewal_enabled {
            return Ok(false);
        }
        let Some(expires_at) = expires_at else {
            return Ok(false);
        };

        let ttl_remaining = expires_at - chrono::Utc::now();
        let fraction = ttl_remaining.num_milliseconds() as f64
            / self.options.expiration.num_milliseconds().max(1) as f64;
        if fraction > self.options.renewal_threshold {
            return Ok(false);
        }

        self.renew(None).await?;
        Ok(true)
    }
}

/// Awaits `fut`, racing it against `cancel` reporting cancellation. The next suspension point
/// inside `fut` (the store's single script-execute call) is where cancellation takes effect.
async fn race_cancel<T>(
    cancel: &mut Option<CancelToken>,
    fut: impl Future<Output = LockResult<T>>,
) -> LockResult<T> {
    tokio::select! {
        result = fut => result,
        _ = cancelled(cancel) => Err(Report::new(LockErrorKind::Cancelled)
            .attach_printable("cancelled waiting on the store")),
    }
}

/// 128 bits of cryptographic randomness, hex-encoded. Never reused across handles, which is
/// what keeps the RELEASE script's identity check safe.
fn generate_holder_value() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_values_are_unique_and_full_width() {
        let a = generate_holder_value();
        let b = generate_holder_value();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
