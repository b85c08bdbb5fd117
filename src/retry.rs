//! Generic exponential-backoff retry decorator.
//!
//! Generalizes the retry loop embedded in [`crate::embedding::embed_openai`]
//! into a reusable wrapper so the same backoff schedule (1s, 2s, 4s) covers
//! every external call in the pipeline: embeddings, vector store, graph
//! store, and LLM calls (§5, §7 `TransientNetworkError`).

use std::time::Duration;

use crate::errors::CoreError;

const BACKOFF_SECS: [u64; 3] = [1, 2, 4];

/// Default attempt count for vector/graph store calls wrapped in
/// [`with_retry`] — the same 3-attempt budget as embedding/LLM calls (§4.4).
pub const STORE_RETRY_ATTEMPTS: usize = 3;

/// Classifies a vector/graph store error as transient or not, so SQLite
/// lock contention is retried the same way a network timeout is (§4.4,
/// §7 `TransientNetworkError`). Anything else propagates unchanged.
pub fn classify_store_error(e: anyhow::Error) -> CoreError {
    let msg = e.to_string();
    if msg.contains("database is locked") || msg.contains("database table is locked") {
        CoreError::TransientNetwork(msg)
    } else {
        CoreError::Other(e)
    }
}

/// Runs `f` up to `attempts` times (default call sites use 3), sleeping
/// `BACKOFF_SECS[i]` between attempts, retrying only on
/// [`CoreError::is_transient`] errors. Non-transient errors return
/// immediately without further attempts.
pub async fn with_retry<T, F, Fut>(attempts: usize, mut f: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CoreError>>,
{
    let mut last_err = None;

    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            let delay = BACKOFF_SECS[(attempt - 1).min(BACKOFF_SECS.len() - 1)];
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| CoreError::TransientNetwork("retry exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn succeeds_immediately_without_retry() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, CoreError> = with_retry(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, CoreError> = with_retry(3, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(CoreError::TransientNetwork("timeout".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_without_retry() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, CoreError> = with_retry(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::Validation)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
