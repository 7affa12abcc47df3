#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]
#![warn(clippy::disallowed_types)]
#![warn(missing_docs)]

//! lynx-redis-lock - A distributed mutual-exclusion lock backed by a Redis-compatible store.
//!
//! A named lock may be held by at most one holder at a time across arbitrary processes.
//! Leases expire automatically if the holder crashes, can be renewed by a live holder, and
//! carry a monotonically increasing fencing token so downstream writers can reject stale
//! updates. This is a single-node-Redis lock, not a Redlock-style quorum algorithm: safety
//! under master failover is not guaranteed, the fencing token exists to let callers protect
//! themselves regardless.

// When docs auto created for docs.rs, will include features, given docs.rs uses nightly by default:
#![cfg_attr(all(doc, CHANNEL_NIGHTLY), feature(doc_auto_cfg))]

mod prelude;

/// Error handling utilities.
pub mod errors;
/// Logging utilities.
pub mod log;
/// Completely miscellaneous utilities.
pub mod misc;
/// Redis-backed distributed lock.
pub mod redis;
/// Concurrency/parallelism utilities.
pub mod threads;

#[cfg(test)]
mod test;
