//! Async retry with exponential backoff, for the storage adapter's
//! internal handling of transient backend failures.
//!
//! Generalized from the corpus's `retry_with_backoff_async` to return a
//! value on success rather than `()`, since every storage operation here
//! produces a result the caller needs.

use std::time::Duration;

use crate::error::StorageError;

/// Retry an async storage operation with exponential backoff.
///
/// Stops retrying as soon as the error is not [`StorageError::is_retryable`],
/// or once `max_attempts` is reached. The delay doubles each attempt,
/// starting from `base_delay`.
pub async fn retry_with_backoff<F, Fut, T>(
    max_attempts: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StorageError>>,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                let delay = base_delay * 2_u32.pow(attempts - 1);
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "retrying after transient storage error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let result = retry_with_backoff(3, Duration::from_millis(1), || async {
            Ok::<_, StorageError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = RefCell::new(0);
        let result = retry_with_backoff(3, Duration::from_millis(1), || {
            let attempts = &attempts;
            async move {
                *attempts.borrow_mut() += 1;
                if *attempts.borrow() < 2 {
                    Err(StorageError::BackendUnavailable("timeout".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(*attempts.borrow(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let result: Result<i32, _> = retry_with_backoff(3, Duration::from_millis(1), || async {
            Err(StorageError::BackendUnavailable("down".into()))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let attempts = RefCell::new(0);
        let result: Result<i32, _> = retry_with_backoff(5, Duration::from_millis(1), || {
            let attempts = &attempts;
            async move {
                *attempts.borrow_mut() += 1;
                Err(StorageError::InvalidArgument("bad input".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(*attempts.borrow(), 1);
    }
}
