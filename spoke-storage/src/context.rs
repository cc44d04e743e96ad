//! Per-operation context: deadline, cancellation and request metadata.
//!
//! Every facade operation takes an `OpContext` as its first parameter.
//! The context carries an absolute deadline, a cancellation token and an
//! optional request id for log correlation. Substrate calls run inside
//! `bound` / `bound_within` so that every suspension point re-checks
//! cancellation and the deadline. Cancellation is not a rollback: a write
//! that already committed stays committed.

use crate::errors::StorageError;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    request_id: Option<String>,
}

impl OpContext {
    /// A context with no deadline and a fresh, never-cancelled token.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            request_id: None,
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Fresh context with a generated request id, for callers that have
    /// none to propagate.
    pub fn for_request() -> Self {
        Self::background().with_request_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left until the deadline. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Surface `Canceled` / `DeadlineExceeded` without awaiting anything.
    /// Called on entry to every operation and after every suspension point.
    pub fn check(&self) -> Result<(), StorageError> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Canceled);
        }
        if let Some(remaining) = self.remaining() {
            if remaining.is_zero() {
                return Err(StorageError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Effective budget for one substrate query: the tighter of the
    /// context deadline and the configured per-query timeout.
    pub fn query_deadline(&self, configured: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(configured),
            None => configured,
        }
    }

    /// Run a future, racing it against cancellation and the context
    /// deadline.
    pub async fn bound<F, T>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = T>,
    {
        match self.remaining() {
            Some(remaining) => self.race(fut, remaining).await,
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(StorageError::Canceled),
                    out = fut => Ok(out),
                }
            }
        }
    }

    /// Like `bound`, but with an explicit budget tighter than (or equal
    /// to) the context deadline. Used for per-query timeouts.
    pub async fn bound_within<F, T>(&self, budget: Duration, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = T>,
    {
        let budget = match self.remaining() {
            Some(remaining) => remaining.min(budget),
            None => budget,
        };
        self.race(fut, budget).await
    }

    async fn race<F, T>(&self, fut: F, budget: Duration) -> Result<T, StorageError>
    where
        F: Future<Output = T>,
    {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Canceled);
        }
        if budget.is_zero() {
            return Err(StorageError::DeadlineExceeded);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StorageError::Canceled),
            _ = tokio::time::sleep(budget) => Err(StorageError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_passes_check() {
        let ctx = OpContext::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_check() {
        let ctx = OpContext::background().with_deadline(Duration::ZERO);
        match ctx.check() {
            Err(StorageError::DeadlineExceeded) => {}
            other => panic!("expected DeadlineExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_token_fails_check() {
        let token = CancellationToken::new();
        let ctx = OpContext::background().with_cancellation(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        match ctx.check() {
            Err(StorageError::Canceled) => {}
            other => panic!("expected Canceled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bound_surfaces_deadline() {
        let ctx = OpContext::background().with_deadline(Duration::from_millis(10));
        let result = ctx
            .bound(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        match result {
            Err(StorageError::DeadlineExceeded) => {}
            other => panic!("expected DeadlineExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bound_surfaces_cancellation_mid_flight() {
        let token = CancellationToken::new();
        let ctx = OpContext::background().with_cancellation(token.clone());
        let handle = tokio::spawn(async move {
            ctx.bound(tokio::time::sleep(Duration::from_secs(5))).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        match handle.await.unwrap() {
            Err(StorageError::Canceled) => {}
            other => panic!("expected Canceled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_deadline_takes_the_tighter_bound() {
        let ctx = OpContext::background().with_deadline(Duration::from_secs(1));
        assert!(ctx.query_deadline(Duration::from_secs(30)) <= Duration::from_secs(1));

        let unbounded = OpContext::background();
        assert_eq!(
            unbounded.query_deadline(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }
}
