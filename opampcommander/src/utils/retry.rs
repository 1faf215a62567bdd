use std::future::Future;
use std::time::Duration;

/// Retries the execution of `f` after the `interval` has elapsed, until `max_attempts` is reached.
/// Returns the result of the first successful execution of `f` or the latest error if all attempts fail.
pub async fn retry<F, Fut, T, E>(max_attempts: usize, interval: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for _ in 0..max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(interval).await;
            }
        }
    }
    Err(last_err.expect("some error must exist at this point"))
}

/// Doubles `current` up to `cap`. Loops that back off on transient errors
/// share this so the growth curve is the same everywhere.
pub fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_success() {
        let result: Result<&str, &str> =
            retry(3, Duration::from_millis(1), || async { Ok("success") }).await;
        assert_eq!(result, Ok("success"));
    }

    #[tokio::test]
    async fn test_retry_failure() {
        let result: Result<&str, &str> =
            retry(3, Duration::from_millis(1), || async { Err("failure") }).await;
        assert_eq!(result, Err("failure"));
    }

    #[tokio::test]
    async fn test_retry_with_multiple_attempts() {
        let mut attempts = 0;
        let result = retry(3, Duration::from_millis(1), || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err("try again")
                } else {
                    Ok("finally succeeded")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("finally succeeded"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = Duration::from_millis(500);
        let cap = Duration::from_secs(5);
        for _ in 0..10 {
            backoff = next_backoff(backoff, cap);
            assert!(backoff <= cap);
        }
        assert_eq!(backoff, cap);
    }
}
