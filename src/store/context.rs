//! Per-call cancellation and deadline carried into every store operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// Cancellation and deadline for a single store call.
///
/// Networked backends race their I/O against this context so that a caller
/// that gives up does not leave a command pending. In-memory backends accept
/// it and never suspend.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tie this context to an existing cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Set an absolute deadline. An earlier deadline already set is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
            _ = deadline => Err(StoreError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let ctx = CallContext::new();
        let value = assert_ok!(ctx.run(async { Ok::<_, StoreError>(7u64) }).await);
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.clone());
        token.cancel();

        let result = ctx
            .run(async {
                std::future::pending::<()>().await;
                Ok::<_, StoreError>(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));

        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, StoreError>(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = CallContext::new()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(5));

        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}
