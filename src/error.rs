// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Error classification.
//!
//! Classifications are tagged variants with a cause, not exceptions:
//! callers match on the returned [`CompactionError`] to decide whether to
//! alert, retry, repair, or skip. `is_halt`/`is_retry` walk `Multi`
//! aggregates so a single Halt anywhere in a batch of worker errors
//! poisons the whole iteration's verdict.

use std::fmt;

use crate::block::BlockId;

/// A classified compaction error.
#[derive(Debug)]
pub enum CompactionError {
    /// Fundamental inconsistency. Surface up; do not retry this
    /// iteration. Callers should alert.
    Halt(anyhow::Error),
    /// Transient (network, bucket 5xx, partial download). Surface up;
    /// the outer controller decides to restart after a backoff.
    Retry(anyhow::Error),
    /// A specific repairable corruption class tied to a block.
    Issue347 { block_id: BlockId, source: anyhow::Error },
    /// Out-of-order chunks found in a block.
    OutOfOrder { block_id: BlockId, source: anyhow::Error },
    /// Aggregate of errors collected from multiple workers/blocks.
    Multi(Vec<CompactionError>),
}

impl CompactionError {
    pub fn halt(err: impl Into<anyhow::Error>) -> Self {
        CompactionError::Halt(err.into())
    }

    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        CompactionError::Retry(err.into())
    }

    pub fn multi(errors: Vec<CompactionError>) -> Self {
        CompactionError::Multi(errors)
    }

    /// `true` if any leaf of this error (including nested `Multi`
    /// children) is [`CompactionError::Halt`].
    pub fn is_halt(&self) -> bool {
        match self {
            CompactionError::Halt(_) => true,
            CompactionError::Retry(_) => false,
            CompactionError::Issue347 { .. } => false,
            CompactionError::OutOfOrder { .. } => false,
            CompactionError::Multi(children) => children.iter().any(CompactionError::is_halt),
        }
    }

    /// `true` iff *every* leaf of this error is
    /// [`CompactionError::Retry`]. A `Multi` with zero children is
    /// vacuously retryable.
    pub fn is_retry(&self) -> bool {
        match self {
            CompactionError::Retry(_) => true,
            CompactionError::Halt(_) => false,
            CompactionError::Issue347 { .. } => false,
            CompactionError::OutOfOrder { .. } => false,
            CompactionError::Multi(children) => children.iter().all(CompactionError::is_retry),
        }
    }

    /// The [`BlockId`] this error is about, for `Issue347`/`OutOfOrder`.
    pub fn block_id(&self) -> Option<&BlockId> {
        match self {
            CompactionError::Issue347 { block_id, .. } => Some(block_id),
            CompactionError::OutOfOrder { block_id, .. } => Some(block_id),
            _ => None,
        }
    }

    /// Re-wraps this error as returned from a retry attempt. A retry of
    /// a Halt-wrapped error remains Halt.
    pub fn as_retry_outcome(self) -> Self {
        match self {
            CompactionError::Halt(e) => CompactionError::Halt(e),
            other => CompactionError::Retry(other.into()),
        }
    }
}

impl fmt::Display for CompactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionError::Halt(e) => write!(f, "halt: {e}"),
            CompactionError::Retry(e) => write!(f, "retry: {e}"),
            CompactionError::Issue347 { block_id, source } => {
                write!(f, "issue-347 corruption in block {block_id}: {source}")
            }
            CompactionError::OutOfOrder { block_id, source } => {
                write!(f, "out-of-order chunks in block {block_id}: {source}")
            }
            CompactionError::Multi(children) => {
                write!(f, "{} errors occurred:", children.len())?;
                for (i, child) in children.iter().enumerate() {
                    write!(f, "\n  {}: {child}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CompactionError {}

impl From<CompactionError> for anyhow::Error {
    fn from(err: CompactionError) -> Self {
        anyhow::anyhow!(err)
    }
}

/// Merges worker-collected errors into a single aggregate, unless there's
/// exactly one, in which case it's surfaced directly.
pub fn aggregate(mut errors: Vec<CompactionError>) -> Option<CompactionError> {
    match errors.len() {
        0 => None,
        1 => Some(errors.pop().expect("len checked above")),
        _ => Some(CompactionError::Multi(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn halt() -> CompactionError {
        CompactionError::halt(anyhow::anyhow!("corrupt index"))
    }

    fn retry() -> CompactionError {
        CompactionError::retry(anyhow::anyhow!("connection reset"))
    }

    #[test]
    fn is_halt_of_wrapped_halt() {
        assert!(halt().is_halt());
    }

    #[test]
    fn is_retry_of_multi_retry() {
        assert!(CompactionError::multi(vec![retry(), retry()]).is_retry());
    }

    #[test]
    fn is_halt_of_multi_with_one_halt() {
        assert!(CompactionError::multi(vec![retry(), halt()]).is_halt());
    }

    #[test]
    fn is_retry_false_when_multi_has_halt() {
        assert!(!CompactionError::multi(vec![retry(), halt()]).is_retry());
    }

    #[test]
    fn retry_of_halt_stays_halt() {
        let wrapped = halt();
        let is_halt_before = wrapped.is_halt();
        let retried = wrapped.as_retry_outcome();
        assert_eq!(is_halt_before, retried.is_halt());
        assert!(retried.is_halt());
    }

    #[test]
    fn aggregate_single_error_not_wrapped_in_multi() {
        let agg = aggregate(vec![retry()]).unwrap();
        assert!(matches!(agg, CompactionError::Retry(_)));
    }

    #[test]
    fn aggregate_empty_is_none() {
        assert!(aggregate(vec![]).is_none());
    }
}
