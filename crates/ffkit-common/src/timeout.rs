//! Timeout utilities.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, crate::KitError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation()).await.map_err(|_| {
        debug!(?timeout, "Operation timed out");
        crate::KitError::Timeout(timeout)
    })
}

/// Run an operation with an optional timeout.
///
/// `None` awaits the operation unbounded.
pub async fn with_optional_timeout<T, F, Fut>(
    timeout: Option<Duration>,
    operation: F,
) -> Result<T, crate::KitError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match timeout {
        Some(limit) => with_timeout(limit, operation).await,
        None => Ok(operation().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_timeout() {
        let result = with_timeout(Duration::from_millis(10), || async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(crate::KitError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_completes_within_timeout() {
        let result = with_timeout(Duration::from_secs(1), || async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_optional_timeout_none_waits() {
        let result = with_optional_timeout(None, || async {
            sleep(Duration::from_millis(5)).await;
            "done"
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }
}
