//! Labeled timeout wrapper for outbound operations.

use crate::error::{EngineError, EngineResult};
use std::future::Future;
use std::time::Duration;

/// Run `op` with a time budget. Settles exactly once: the first of
/// {operation completes, timer fires} wins and the loser is dropped.
///
/// The label names the operation in the resulting
/// [`EngineError::Timeout`] so a fired timeout is attributable in logs.
pub async fn with_timeout<T, F>(op: F, budget_ms: u64, label: &str) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(budget_ms), op).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            label: label.to_string(),
            budget_ms,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[tokio::test]
    async fn test_completes_within_budget() {
        let result = with_timeout(async { Ok(42) }, 1_000, "fast-op").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_budget_exceeded_is_labeled_timeout() {
        let result: EngineResult<()> = with_timeout(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            10,
            "slow-op",
        )
        .await;

        let err = result.unwrap_err();
        match &err {
            EngineError::Timeout { label, budget_ms } => {
                assert_eq!(label, "slow-op");
                assert_eq!(*budget_ms, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: EngineResult<()> = with_timeout(
            async { Err(EngineError::Internal("boom".into())) },
            1_000,
            "failing-op",
        )
        .await;

        assert!(matches!(result.unwrap_err(), EngineError::Internal(_)));
    }
}
