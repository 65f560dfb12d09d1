//! Shared exponential backoff used by the entity store, search and LLM
//! clients when a call fails with a retryable error.

use std::future::Future;
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 5;
pub const BASE_DELAY: Duration = Duration::from_millis(200);

/// Errors that know whether a retry could plausibly change the outcome.
/// Implemented by each HTTP collaborator's error enum so `retry` never
/// spends the attempt budget on a 4xx or a decode failure.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

pub async fn retry<T, E, F, Fut>(mut call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < MAX_ATTEMPTS && e.is_retryable() => {
                let delay = BASE_DELAY * 2u32.pow(attempt - 1);
                tracing::warn!(attempt, %e, ?delay, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    struct Transient(&'static str);

    impl std::fmt::Display for Transient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Retryable for Transient {
        fn is_retryable(&self) -> bool {
            true
        }
    }

    #[derive(Debug, PartialEq)]
    struct Permanent(&'static str);

    impl std::fmt::Display for Permanent {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Retryable for Permanent {
        fn is_retryable(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Transient> = retry(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Transient("not yet"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Transient> = retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Transient("always fails"))
        })
        .await;
        assert_eq!(result, Err(Transient("always fails")));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Permanent> = retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Permanent("not found"))
        })
        .await;
        assert_eq!(result, Err(Permanent("not found")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
