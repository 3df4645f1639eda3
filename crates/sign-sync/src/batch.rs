//! Sequential batches of concurrent API calls.

use std::future::Future;

use futures_util::future::join_all;
use signsync_core::error::{Result, SignSyncError};
use tokio::sync::Semaphore;
use tracing::{error, info};

/// One record a bulk call could not process.
#[derive(Debug)]
pub struct BatchFailure {
    pub id: String,
    pub error: SignSyncError,
}

/// Outcome of a bulk call.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    /// Collect per-record results, logging each failure with its record id.
    pub fn collect<I, R>(ids: I, results: Vec<Result<R>>, operation: &str, org: &str) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut report = Self::default();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    error!(org, id = %id, operation, error = %e, "Sign API call failed");
                    report.failures.push(BatchFailure { id, error: e });
                }
            }
        }
        report
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run `op` over `items` in batches of `batch_size`.
///
/// Batches run strictly one after another. Within a batch at most
/// `concurrency` calls are in flight; each holds a permit until it finishes.
/// Results come back in input order.
pub async fn run_batched<'a, T, R, F, Fut>(
    items: &'a [T],
    batch_size: usize,
    concurrency: usize,
    org: &str,
    op: F,
) -> Vec<Result<R>>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let batch_size = batch_size.max(1);
    let batches = items.len().div_ceil(batch_size);
    let mut results = Vec::with_capacity(items.len());

    for (index, batch) in items.chunks(batch_size).enumerate() {
        info!(org, batch = index + 1, batches, size = batch.len(), "processing batch");
        let permits = Semaphore::new(concurrency.max(1));
        let calls = batch.iter().map(|item| {
            let permits = &permits;
            let call = op(item);
            async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|e| SignSyncError::Sync(format!("permit pool closed: {e}")))?;
                call.await
            }
        });
        results.extend(join_all(calls).await);
    }

    results
}
