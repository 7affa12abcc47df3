/// Sleep for a duration, used by the retry engine between attempts.
pub async fn sleep_compat(duration: chrono::Duration) {
    tokio::time::sleep(duration.to_std().unwrap_or_default()).await;
}
