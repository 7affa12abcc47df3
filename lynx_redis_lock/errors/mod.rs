mod any;
mod result_ext;

pub use any::AnyErr;
pub use result_ext::LockResultExt;

use error_stack::Context;

/// The error taxonomy for the lock. Every fallible operation in [`crate::redis`] fails with
/// one of these kinds, wrapped in an [`error_stack::Report`].
///
/// The retry engine ([`crate::misc::Retry`] as driven by [`crate::redis::RetryStrategy`]) only
/// ever retries [`LockErrorKind::Contended`] and [`LockErrorKind::Unavailable`]; everything else
/// surfaces to the caller immediately.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorKind {
    /// The key is currently held by a different holder.
    Contended,
    /// Transport failure or timeout talking to the store.
    Unavailable,
    /// The calling context was cancelled before the operation completed.
    Cancelled,
    /// A bad argument was supplied (e.g. a non-positive TTL, an empty key, reentry past the
    /// configured ceiling).
    InvalidArgument,
    /// `Release` or `Renew` was attempted on a lease this handle doesn't (or no longer) own.
    NotHeld,
    /// `Renew` reported the lease as lost; the handle has transitioned to `Released`.
    LeaseLost,
    /// The retry engine exhausted its budget (attempts, elapsed time) without succeeding.
    RetriesExhausted,
    /// `Acquire` was attempted after the shutdown coordinator engaged.
    ShuttingDown,
}

impl LockErrorKind {
    /// Whether the retry engine is permitted to retry an operation that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, LockErrorKind::Contended | LockErrorKind::Unavailable)
    }

    /// Stable machine-readable name, used as the key in the `errors_total{kind}` stats map.
    pub fn as_str(self) -> &'static str {
        match self {
            LockErrorKind::Contended => "contended",
            LockErrorKind::Unavailable => "unavailable",
            LockErrorKind::Cancelled => "cancelled",
            LockErrorKind::InvalidArgument => "invalid_argument",
            LockErrorKind::NotHeld => "not_held",
            LockErrorKind::LeaseLost => "lease_lost",
            LockErrorKind::RetriesExhausted => "retries_exhausted",
            LockErrorKind::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for LockErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockErrorKind::Contended => "contended",
            LockErrorKind::Unavailable => "unavailable",
            LockErrorKind::Cancelled => "cancelled",
            LockErrorKind::InvalidArgument => "invalid argument",
            LockErrorKind::NotHeld => "not held",
            LockErrorKind::LeaseLost => "lease lost",
            LockErrorKind::RetriesExhausted => "retries exhausted",
            LockErrorKind::ShuttingDown => "shutting down",
        };
        write!(f, "{}", s)
    }
}

impl Context for LockErrorKind {}

/// A [`Result`](std::result::Result) whose error variant is a [`LockErrorKind`] report.
///
/// Display text built from this never includes the holder value, only the key and kind,
/// since the holder value is treated as sensitive (it can be supplied externally to
/// [`crate::redis::LockService::unlock_by_value`]).
pub type LockResult<T> = error_stack::Result<T, LockErrorKind>;

pub(crate) mod prelude {
    pub use error_stack::{Result, ResultExt};

    pub use super::any::AnyErr;
    pub use super::result_ext::LockResultExt;
    pub use super::{LockErrorKind, LockResult};
}
