/// Record a handled exception against the active tracing span, without failing the calling
/// operation. Used for failures that are visible in logs/traces but that the lock degrades
/// gracefully from (a decode failure on a script reply, a failed attempt to kill a standalone
/// test server, ...).
#[track_caller]
pub fn record_exception(message: impl Into<String>, detail: impl Into<String>) {
    let location = std::panic::Location::caller();
    tracing::error!(
        target: "lynx_redis_lock::exception",
        %location,
        detail = %detail.into(),
        "{}",
        message.into(),
    );
}
