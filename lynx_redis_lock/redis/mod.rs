mod lock;
mod options;
mod registry;
mod renewal;
mod script;
mod scripts;
mod service;
mod shutdown;
mod standalone_redis;
mod store;
mod token;

pub use lock::{HandleState, LockHandle};
pub use options::{LockOptions, RenewalConfig, RetryStrategy};
pub use registry::{Histogram, Stats};
pub use service::LockService;
pub use standalone_redis::RedisStandalone;
pub use store::Store;

#[cfg(test)]
mod tests;
