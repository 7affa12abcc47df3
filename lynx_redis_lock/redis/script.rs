use std::time::Duration;

use deadpool_redis::redis::{FromRedisValue, Script, ScriptInvocation};

use crate::errors::prelude::*;

/// A wrapper around a redis script, compiled once and reused across calls.
pub struct RedisScript {
    script: Script,
}

impl RedisScript {
    /// Create a new redis script from the given static string. This object should be reused.
    pub fn new(script: &'static str) -> Self {
        Self {
            script: Script::new(script),
        }
    }

    /// Run the script against a pooled connection, bounded by `timeout`.
    ///
    /// A timed-out or transport-failed call surfaces as [`LockErrorKind::Unavailable`], which
    /// the retry engine treats as retryable.
    pub async fn run<ReturnType>(
        &self,
        conn: &mut deadpool_redis::Connection,
        timeout: Duration,
        cb: impl FnOnce(&mut ScriptInvocation<'_>),
    ) -> LockResult<ReturnType>
    where
        ReturnType: FromRedisValue,
    {
        let mut invocation = self.script.prepare_invoke();
        cb(&mut invocation);

        match tokio::time::timeout(timeout, invocation.invoke_async(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Report::new(LockErrorKind::Unavailable)
                .attach_printable(format!("script call failed: {:?}", e))),
            Err(_) => Err(Report::new(LockErrorKind::Unavailable)
                .attach_printable(format!("script call exceeded {:?} timeout", timeout))),
        }
    }
}
