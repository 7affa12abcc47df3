use std::collections::HashMap;

use futures::{stream::FuturesUnordered, Future, StreamExt};

/// Run an iterator of future-producing closures with at most `limit` running concurrently,
/// returning the results in the same order as the inputs.
///
/// Used by the renewal service to fan a single tick's due leases out across a bounded worker
/// pool instead of spawning one task per lease.
pub async fn run_bounded<R, Fut: Future<Output = R>>(
    limit: usize,
    fut_cbs: impl IntoIterator<Item = impl FnOnce() -> Fut>,
) -> Vec<R> {
    let limit = limit.max(1);

    let mut return_index = 0;
    let mut results = vec![];
    let mut pending: HashMap<usize, R> = HashMap::new();

    let mut stream = FuturesUnordered::new();
    for (index, fut_cb) in fut_cbs.into_iter().enumerate() {
        stream.push(async move { (index, fut_cb().await) });
        if stream.len() >= limit {
            if let Some((index, result)) = stream.next().await {
                drain_into(index, result, &mut return_index, &mut pending, &mut results);
            }
        }
    }

    while let Some((index, result)) = stream.next().await {
        drain_into(index, result, &mut return_index, &mut pending, &mut results);
    }

    results
}

fn drain_into<R>(
    index: usize,
    result: R,
    return_index: &mut usize,
    pending: &mut HashMap<usize, R>,
    results: &mut Vec<R>,
) {
    if index == *return_index {
        results.push(result);
        *return_index += 1;
    } else {
        pending.insert(index, result);
    }
    while let Some(result) = pending.remove(return_index) {
        results.push(result);
        *return_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn preserves_input_order() {
        let items: Vec<usize> = (0..20).collect();
        let results = run_bounded(
            4,
            items.iter().map(|i| {
                let i = *i;
                move || async move {
                    if i % 3 == 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    }
                    i
                }
            }),
        )
        .await;
        assert_eq!(results, items);
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let in_flight = std::sync::Arc::new(AtomicUsize::new(0));
        let max_seen = std::sync::Arc::new(AtomicUsize::new(0));

        let items: Vec<usize> = (0..30).collect();
        let _ = run_bounded(
            3,
            items.iter().map(|_| {
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }),
        )
        .await;

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }
}
