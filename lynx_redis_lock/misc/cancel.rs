use tokio::sync::watch;

/// A cancellation signal shared between a caller and whatever it asked to run.
///
/// `true` once cancellation has been requested. Cheap to clone (it's a `watch::Receiver`), so
/// the same token can be handed to several operations that should all abort together.
pub type CancelToken = watch::Receiver<bool>;

/// `true` if `token` is set and currently reports cancellation.
pub fn is_cancelled(token: &Option<CancelToken>) -> bool {
    token.as_ref().is_some_and(|t| *t.borrow())
}

/// Resolves once `token` reports cancellation. Never resolves if `token` is `None`, so it's
/// safe to race against with `tokio::select!` regardless of whether a caller supplied one.
pub async fn cancelled(token: &mut Option<CancelToken>) {
    match token {
        Some(token) => loop {
            if *token.borrow() {
                return;
            }
            if token.changed().await.is_err() {
                // Sender dropped without ever cancelling; equivalent to "never cancels".
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}
