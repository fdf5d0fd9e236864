//! Per-call context: cancellation and tracing span.
//!
//! Every remote call a backend makes goes through [`CallContext::call`], which
//! races the call against the caller's cancellation token and attributes it
//! to the caller's span. A cancelled call returns
//! [`SchedulerError::Cancelled`]; the in-flight request future is dropped.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::error::{ApiError, SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    span: Span,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(CancellationToken::new(), Span::current())
    }
}

impl CallContext {
    pub fn new(cancel: CancellationToken, span: Span) -> Self {
        Self { cancel, span }
    }

    /// Context that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self::new(CancellationToken::new(), Span::none())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Derived context: cancelled with the parent, and independently.
    pub fn child(&self) -> Self {
        Self::new(self.cancel.child_token(), self.span.clone())
    }

    pub fn with_span(&self, span: Span) -> Self {
        Self::new(self.cancel.clone(), span)
    }

    /// Issue one remote API call under this context.
    ///
    /// API failures are wrapped as [`SchedulerError::Backend`] naming
    /// `operation` and `target`.
    pub async fn call<T, F>(
        &self,
        operation: &'static str,
        target: &str,
        fut: F,
    ) -> SchedulerResult<T>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        self.guard(operation, async {
            fut.await
                .map_err(|source| SchedulerError::backend(operation, target, source))
        })
        .await
    }

    /// Run an arbitrary step under this context's cancellation and span.
    pub async fn guard<T, F>(&self, operation: &'static str, fut: F) -> SchedulerResult<T>
    where
        F: Future<Output = SchedulerResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled { operation });
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SchedulerError::Cancelled { operation }),
            result = fut.instrument(self.span.clone()) => result,
        }
    }
}
