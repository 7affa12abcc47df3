#![allow(missing_docs)]
// Above needed because rstest fixture macro seems to produce undocumented functions and structs.

use rstest::*;

/// Include this in a test to turn on tracing output globally for the process.
#[fixture]
#[once]
pub fn logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A throwaway `redis-server` on an unused port, killed when the test finishes.
#[fixture]
pub async fn redis_standalone() -> crate::redis::RedisStandalone {
    crate::redis::RedisStandalone::new()
        .await
        .expect("failed to start standalone redis-server for tests")
}
