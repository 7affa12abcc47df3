use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::errors::LockErrorKind;
use crate::misc::sleep_compat;
use crate::threads::run_bounded;

use super::lock::LockHandle;
use super::registry::{Registry, Stats};
use super::shutdown::ShutdownCoordinator;

const DEFAULT_RENEWAL_INTERVAL: chrono::Duration = chrono::Duration::seconds(10);
const MIN_RENEWAL_INTERVAL: chrono::Duration = chrono::Duration::milliseconds(50);

enum TickOutcome {
    Renewed,
    Skipped,
    LeaseLost,
    TransportFailed,
}

async fn renew_one(handle: Arc<LockHandle>) -> TickOutcome {
    let max_retries = handle.renewal_config().max_retries;
    let mut attempt = 0;
    loop {
        match handle.renew_if_due().await {
            Ok(false) => return TickOutcome::Skipped,
            Ok(true) => return TickOutcome::Renewed,
            Err(report) if *report.current_context() == LockErrorKind::LeaseLost => {
                return TickOutcome::LeaseLost
            }
            Err(report) if report.current_context().is_retryable() && attempt < max_retries => {
                attempt += 1;
                sleep_compat(chrono::Duration::milliseconds(50 * attempt as i64)).await;
            }
            Err(_) => return TickOutcome::TransportFailed,
        }
    }
}

async fn run_tick(registry: &Registry, stats: &Stats) {
    let handles = registry.snapshot();
    if handles.is_empty() {
        return;
    }
    let worker_pool_size = handles
        .iter()
        .map(|h| h.worker_pool_size())
        .max()
        .unwrap_or(4);

    let outcomes = run_bounded(
        worker_pool_size,
        handles.into_iter().map(|handle| move || renew_one(handle)),
    )
    .await;

    for outcome in outcomes {
        match outcome {
            TickOutcome::Renewed => {
                stats.renewal_count.fetch_add(1, Ordering::Relaxed);
            }
            TickOutcome::Skipped => {
                stats.skipped_renewals.fetch_add(1, Ordering::Relaxed);
            }
            TickOutcome::LeaseLost => {
                stats.renewal_errors.fetch_add(1, Ordering::Relaxed);
            }
            TickOutcome::TransportFailed => {
                stats.renewal_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn next_interval(registry: &Registry) -> chrono::Duration {
    let smallest_expiration = registry
        .snapshot()
        .iter()
        .map(|h| h.expiration())
        .min()
        .unwrap_or(DEFAULT_RENEWAL_INTERVAL);

    DEFAULT_RENEWAL_INTERVAL
        .min(smallest_expiration / 2)
        .max(MIN_RENEWAL_INTERVAL)
}

/// The single background task per process that keeps `Held` handles from expiring.
///
/// Started lazily the first time a handle is registered, stopped by the shutdown coordinator.
/// It never calls user code, only RENEW and counter/`expires_at` bookkeeping, reaching handles
/// solely through [`Registry`] snapshots rather than direct back-pointers.
pub(crate) struct RenewalService {
    registry: Arc<Registry>,
    stats: Arc<Stats>,
    shutdown: Arc<ShutdownCoordinator>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RenewalService {
    pub(crate) fn new(
        registry: Arc<Registry>,
        stats: Arc<Stats>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            stats,
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Spawns the background loop if it isn't already running. Safe to call on every
    /// acquisition; only the first call after construction or after [`Self::stop`] has any
    /// effect.
    pub(crate) async fn ensure_started(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                if shutdown.is_shutting_down() {
                    break;
                }
                let interval = next_interval(&registry);
                tokio::select! {
                    _ = sleep_compat(interval) => {}
                    _ = shutdown.notified() => break,
                }
                if shutdown.is_shutting_down() {
                    break;
                }
                run_tick(&registry, &stats).await;
            }
        }));
    }

    /// Engages the shutdown coordinator (idempotent) and waits for the background loop to
    /// exit.
    pub(crate) async fn stop(&self) {
        self.shutdown.engage();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_floors_at_minimum() {
        let registry = Registry::default();
        assert_eq!(next_interval(&registry), DEFAULT_RENEWAL_INTERVAL);
    }
}
