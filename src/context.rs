// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A cancellable, deadline-aware context threaded through every
//! operation that can be cut short mid-flight.
//!
//! Two concerns are deliberately kept orthogonal: cancellation
//! (propagated from the Scheduler's iteration-scoped token) and
//! deadlines (either the iteration's `maxCompactionTime` or a fixed
//! 5-minute detached window for mark writes). [`CompactionContext::detach`]
//! derives a context that keeps the deadline machinery but drops the
//! inherited cancellation token, so a shutdown mid-cleanup can't leave a
//! mark half-written.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Fixed timeout used for detached mark-for-deletion writes.
pub const DETACHED_MARK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CompactionContext {
    cancel: CancellationToken,
    deadline: Option<Duration>,
}

impl CompactionContext {
    /// A context with no cancellation and no deadline.
    pub fn background() -> Self {
        CompactionContext {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context bound to an iteration's cancellation token and optional
    /// `maxCompactionTime` wall-clock budget.
    pub fn for_iteration(cancel: CancellationToken, deadline: Option<Duration>) -> Self {
        CompactionContext { cancel, deadline }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Derives a context that does *not* inherit this context's
    /// cancellation, but carries its own fixed deadline. Used for
    /// mark-for-deletion writes so a shutdown mid-GC/retire does not
    /// leave marks half-written.
    pub fn detach(&self) -> Self {
        CompactionContext {
            cancel: CancellationToken::new(),
            deadline: Some(DETACHED_MARK_TIMEOUT),
        }
    }

    /// Runs `fut` to completion, racing it against cancellation and any
    /// configured deadline. Cancellation and deadline both resolve to
    /// `Err`; the caller decides how to classify that as Halt/Retry.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ContextError>
    where
        F: Future<Output = T>,
    {
        let cancelled = self.cancel.cancelled();
        tokio::pin!(fut);
        let fut = async move { fut.await };
        let raced = async {
            tokio::select! {
                biased;
                _ = cancelled => Err(ContextError::Cancelled),
                out = fut => Ok(out),
            }
        };
        match self.deadline {
            Some(d) => match tokio::time::timeout(d, raced).await {
                Ok(res) => res,
                Err(_) => Err(ContextError::DeadlineExceeded),
            },
            None => raced.await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    Cancelled,
    DeadlineExceeded,
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextError::Cancelled => write!(f, "context cancelled"),
            ContextError::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

impl std::error::Error for ContextError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detach_survives_parent_cancellation() {
        let parent = CompactionContext::for_iteration(CancellationToken::new(), None);
        parent.cancellation_token().cancel();
        assert!(parent.is_cancelled());

        let detached = parent.detach();
        assert!(!detached.is_cancelled());
        let res = detached.run(async { 42 }).await;
        assert_eq!(res.unwrap(), 42);
    }

    #[tokio::test]
    async fn parent_cancellation_aborts_run() {
        let parent = CompactionContext::for_iteration(CancellationToken::new(), None);
        let token = parent.cancellation_token().clone();
        token.cancel();
        let res = parent
            .run(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                1
            })
            .await;
        assert_eq!(res.unwrap_err(), ContextError::Cancelled);
    }

    #[tokio::test]
    async fn deadline_times_out() {
        let ctx = CompactionContext::for_iteration(
            CancellationToken::new(),
            Some(Duration::from_millis(10)),
        );
        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                1
            })
            .await;
        assert_eq!(res.unwrap_err(), ContextError::DeadlineExceeded);
    }
}
