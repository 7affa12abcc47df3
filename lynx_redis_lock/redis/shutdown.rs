use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Process-wide shutdown flag shared between [`super::LockService`], every
/// [`super::lock::LockHandle`] it creates, and the renewal service.
///
/// Engaging it never calls RELEASE on anyone's behalf: locks still held at shutdown remain in
/// the store and simply expire at their TTL, since forcing a release could cut a caller's
/// critical section out from under it.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    shutting_down: AtomicBool,
    notify: Notify,
}

impl ShutdownCoordinator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            shutting_down: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub(crate) fn engage(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Resolves once [`Self::engage`] has been called, to let the renewal loop wake up early
    /// instead of waiting out its full sleep interval.
    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engage_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutting_down());

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator.notified().await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        coordinator.engage();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve promptly")
            .expect("waiter task should not panic");

        assert!(coordinator.is_shutting_down());
    }
}
