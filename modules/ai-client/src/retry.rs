use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::AiError;

const BASE_DELAY_MS: u64 = 500;

/// Retry a provider call with exponential backoff. Only transient errors
/// (rate limits, 5xx, timeouts) are retried; validation failures surface
/// immediately. `max_attempts` counts the first try.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    mut call: F,
) -> Result<T, AiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AiError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = Duration::from_millis(BASE_DELAY_MS << (attempt - 1));
                warn!(
                    call = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error, retrying"
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
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> AiError {
        AiError::Provider {
            status: 503,
            message: "overloaded".into(),
        }
    }

    fn permanent() -> AiError {
        AiError::Malformed("not json".into())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_on_persistent_transient() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_backoff("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_backoff("test", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(permanent()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_calls_once() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", 0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(1) }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
