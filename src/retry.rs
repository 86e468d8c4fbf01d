use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use tracing::warn;

use crate::error::{ImporterError, Result};

/// How long store operations keep retrying transient failures.
#[derive(Debug, Clone, Copy,)]
pub struct RetryPolicy {
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn new(max_elapsed: Duration,) -> Self {
        Self { max_elapsed, }
    }

    /// Fail on the first error, transient or not.
    pub fn none() -> Self {
        Self {
            max_elapsed: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_elapsed: Duration::from_secs(60,),
        }
    }
}

pub async fn execute_with_retry<F, Fut, T,>(policy: RetryPolicy, operation: F,) -> Result<T,>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, backoff::Error<ImporterError,>,>,>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200,),)
        .with_max_interval(Duration::from_secs(10,),)
        .with_max_elapsed_time(Some(policy.max_elapsed,),)
        .build();

    retry(backoff, operation,).await
}

/// Helper to wrap an ImporterError into a backoff::Error.
pub fn transient_error(err: ImporterError,) -> backoff::Error<ImporterError,> {
    warn!("Transient error encountered, retrying: {}", err);
    backoff::Error::transient(err,)
}

pub fn permanent_error(err: ImporterError,) -> backoff::Error<ImporterError,> {
    backoff::Error::permanent(err,)
}

pub fn wrap_error(err: ImporterError,) -> backoff::Error<ImporterError,> {
    if err.is_transient() {
        transient_error(err,)
    } else {
        permanent_error(err,)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0,),);
        let res: Result<(),> = execute_with_retry(RetryPolicy::default(), || {
            let attempts = Arc::clone(&attempts,);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst,);
                Err(wrap_error(ImporterError::DatabaseError("constraint violation".to_string(),),),)
            }
        },)
        .await;

        assert!(res.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0,),);
        let policy = RetryPolicy::new(Duration::from_secs(30,),);
        let res = execute_with_retry(policy, || {
            let attempts = Arc::clone(&attempts,);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst,) < 2 {
                    Err(wrap_error(ImporterError::ConnectionError("reset".to_string(),),),)
                } else {
                    Ok(42,)
                }
            }
        },)
        .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
