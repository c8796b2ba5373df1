//! Deadline and cancellation carried into every client operation.

use crate::error::QueueError;
use chrono::Duration;
use std::future::Future;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;

/// Bounds for one client operation.
///
/// The default context has no deadline and is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    deadline: Option<Duration>,
    cancellation: CancellationToken,
}

impl OperationContext {
    /// Context without deadline or cancellation
    pub fn background() -> Self {
        Self::default()
    }

    /// Bound every operation run under this context by `deadline`
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Use `token` to cancel operations run under this context
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Drive `future` to completion unless the deadline passes or the
    /// context is cancelled first.
    pub async fn run<F, T>(&self, operation: &str, future: F) -> Result<T, QueueError>
    where
        F: Future<Output = Result<T, QueueError>>,
    {
        if self.cancellation.is_cancelled() {
            return Err(QueueError::Cancelled {
                operation: operation.to_string(),
            });
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => {
                    let limit = deadline.to_std().unwrap_or_default();
                    match tokio::time::timeout(limit, future).await {
                        Ok(result) => result,
                        Err(_) => Err(QueueError::Timeout { duration: deadline }),
                    }
                }
                None => future.await,
            }
        };

        tokio::select! {
            result = bounded => result,
            _ = self.cancellation.cancelled() => Err(QueueError::Cancelled {
                operation: operation.to_string(),
            }),
        }
    }
}
