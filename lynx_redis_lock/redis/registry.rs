use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::errors::LockErrorKind;

use super::lock::LockHandle;

/// A crude running-mean accumulator, standing in for the "histograms" of hold/retry duration
/// called for in the stats surface. There's no metrics-export sink in this crate (that's an
/// external collaborator's job), so a full HDR histogram would be more than this snapshot
/// needs; count + sum is enough to report a mean via [`Histogram::mean_millis`].
#[derive(Debug, Default)]
pub struct Histogram {
    count: AtomicU64,
    sum_millis: AtomicU64,
}

impl Histogram {
    fn observe(&self, duration: chrono::Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_millis
            .fetch_add(duration.num_milliseconds().max(0) as u64, Ordering::Relaxed);
    }

    /// Mean observation in milliseconds, or `0.0` if nothing has been observed yet.
    pub fn mean_millis(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            self.sum_millis.load(Ordering::Relaxed) as f64 / count as f64
        }
    }

    /// Number of observations recorded.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Process-wide operational counters. The sole source of truth for [`super::LockService::get_stats`].
#[derive(Debug, Default)]
pub struct Stats {
    /// Total handles ever registered (monotonic, never decremented).
    pub total_locks: AtomicU64,
    /// Handles currently in the `Held` state.
    pub active_locks: AtomicI64,
    /// Successful first-acquisitions and reentries combined.
    pub acquisitions_total: AtomicU64,
    /// Successful (full or partial) releases.
    pub releases_total: AtomicU64,
    /// Failed operations, broken down by kind.
    pub errors_total: DashMap<&'static str, AtomicU64>,
    /// Renewal service ticks that successfully extended a lease.
    pub renewal_count: AtomicU64,
    /// Renewal service ticks that failed (lease lost or exhausted transport retries).
    pub renewal_errors: AtomicU64,
    /// Renewal service ticks that didn't need to do anything this pass.
    pub skipped_renewals: AtomicU64,
    /// Leases the renewal service observed as lost.
    pub expirations_total: AtomicU64,
    /// Retry attempts made by the retry engine (not counting the initial attempt).
    pub retries_total: AtomicU64,
    /// Acquisitions that exhausted their retry budget.
    pub retry_failures_total: AtomicU64,
    /// Distribution of how long handles stayed `Held` before a full release.
    pub hold_duration: Histogram,
    /// Distribution of how long `AcquireWithRetry` took end to end.
    pub retry_duration: Histogram,
}

impl Stats {
    pub(crate) fn record_error(&self, kind: LockErrorKind) {
        self.errors_total
            .entry(kind.as_str())
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hold_duration(&self, duration: chrono::Duration) {
        self.hold_duration.observe(duration);
    }

    pub(crate) fn record_retry_duration(&self, duration: chrono::Duration) {
        self.retry_duration.observe(duration);
    }

    /// Flat snapshot suitable for a metrics exporter to consume.
    pub fn snapshot(&self) -> std::collections::HashMap<String, f64> {
        let mut out = std::collections::HashMap::new();
        out.insert("total_locks".into(), self.total_locks.load(Ordering::Relaxed) as f64);
        out.insert("active_locks".into(), self.active_locks.load(Ordering::Relaxed) as f64);
        out.insert(
            "acquisitions_total".into(),
            self.acquisitions_total.load(Ordering::Relaxed) as f64,
        );
        out.insert("releases_total".into(), self.releases_total.load(Ordering::Relaxed) as f64);
        out.insert("renewal_count".into(), self.renewal_count.load(Ordering::Relaxed) as f64);
        out.insert("renewal_errors".into(), self.renewal_errors.load(Ordering::Relaxed) as f64);
        out.insert(
            "skipped_renewals".into(),
            self.skipped_renewals.load(Ordering::Relaxed) as f64,
        );
        out.insert(
            "expirations_total".into(),
            self.expirations_total.load(Ordering::Relaxed) as f64,
        );
        out.insert("retries_total".into(), self.retries_total.load(Ordering::Relaxed) as f64);
        out.insert(
            "retry_failures_total".into(),
            self.retry_failures_total.load(Ordering::Relaxed) as f64,
        );
        out.insert("hold_duration_mean_ms".into(), self.hold_duration.mean_millis());
        out.insert("retry_duration_mean_ms".into(), self.retry_duration.mean_millis());
        for entry in self.errors_total.iter() {
            out.insert(format!("errors_total.{}", entry.key()), entry.value().load(Ordering::Relaxed) as f64);
        }
        out
    }
}

/// Process-wide set of live handles, keyed by a process-unique handle id.
///
/// Mutated only on first-acquire (insert) and full-release/lease-loss (remove); the renewal
/// service and stats snapshot only ever take a non-exclusive iteration over it.
#[derive(Debug, Default)]
pub struct Registry {
    handles: DashMap<u64, Arc<LockHandle>>,
}

impl Registry {
    pub(crate) fn insert(&self, id: u64, handle: Arc<LockHandle>) {
        self.handles.insert(id, handle);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.handles.remove(&id);
    }

    /// Snapshot of every currently-registered handle. Cheap `Arc` clones, safe to iterate
    /// while other tasks concurrently insert/remove.
    pub(crate) fn snapshot(&self) -> Vec<Arc<LockHandle>> {
        self.handles.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}
