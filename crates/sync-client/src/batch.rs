//! Bounded-concurrency execution of per-file transfers.

use futures::future::join_all;
use std::future::Future;

/// Results of a batched run.
#[derive(Debug)]
pub struct BatchReport<T, E> {
    /// One result per attempted item, in input order. Shorter than the
    /// input when the run stopped early.
    pub results: Vec<Result<T, E>>,
    /// A fatal error stopped the run before every item was attempted
    pub aborted: bool,
}

/// Run `op` over `items` in chunks of `batch_size`, each chunk concurrently.
///
/// Every item in a chunk runs to completion even if a sibling fails. No
/// further chunk starts once a chunk produced an error for which
/// `is_fatal` returns true.
pub async fn run_batched<'a, I, T, E, F, Fut>(
    items: &'a [I],
    batch_size: usize,
    op: F,
    is_fatal: impl Fn(&E) -> bool,
) -> BatchReport<T, E>
where
    F: Fn(&'a I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut results = Vec::with_capacity(items.len());

    for chunk in items.chunks(batch_size.max(1)) {
        let chunk_results = join_all(chunk.iter().map(&op)).await;
        let fatal = chunk_results
            .iter()
            .any(|r| r.as_ref().is_err_and(|e| is_fatal(e)));
        results.extend(chunk_results);

        if fatal {
            let aborted = results.len() < items.len();
            return BatchReport { results, aborted };
        }
    }

    BatchReport {
        results,
        aborted: false,
    }
}
