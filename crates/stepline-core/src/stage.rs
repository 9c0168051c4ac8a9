// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The stage contract.
//!
//! A stage is one unit of forward work paired with the action that undoes
//! it. Stages hold no per-instance state: everything they need to resume or
//! compensate after a crash must be written to the working map before they
//! return, because that map is all the engine persists.
//!
//! The forward action may run more than once for the same instance (retries,
//! or a crash mid-stage followed by recovery), so it must be safe to repeat.

use async_trait::async_trait;

use crate::context::StageContext;
use crate::value::MapError;

/// Well-known failure codes.
pub mod codes {
    /// Transient failure, governed by the stage's retry policy.
    pub const STAGE_RETRYABLE: &str = "STAGE_RETRYABLE";
    /// Non-retryable failure that starts compensation.
    pub const STAGE_FATAL: &str = "STAGE_FATAL";
    /// A named resource lock is held by another instance.
    pub const RESOURCE_LOCKED: &str = "RESOURCE_LOCKED";
    /// The retry policy gave up on a transient failure.
    pub const RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";
    /// A compensate action failed; the instance needs operator attention.
    pub const COMPENSATION_FAILED: &str = "COMPENSATION_FAILED";
    /// The workflow type could not be rebuilt during recovery.
    pub const INVALID_WORKFLOW: &str = "INVALID_WORKFLOW";
    /// A typed parameter had the wrong kind.
    pub const TYPE_MISMATCH: &str = "TYPE_MISMATCH";
    /// A required parameter was absent.
    pub const MISSING_KEY: &str = "MISSING_KEY";
}

/// Whether the engine may try a failed action again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    /// Consult the retry policy.
    Retryable,
    /// Stop immediately.
    Fatal,
}

/// Failure reported by a stage's `run` or `compensate`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct StageError {
    kind: StageErrorKind,
    code: String,
    message: String,
}

impl StageError {
    /// A transient failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Retryable,
            code: codes::STAGE_RETRYABLE.to_string(),
            message: message.into(),
        }
    }

    /// A failure that should not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Fatal,
            code: codes::STAGE_FATAL.to_string(),
            message: message.into(),
        }
    }

    /// Replace the error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Same code and message, but no longer retryable.
    pub fn into_fatal(mut self) -> Self {
        self.kind = StageErrorKind::Fatal;
        self
    }

    /// The error kind.
    pub fn kind(&self) -> StageErrorKind {
        self.kind
    }

    /// Whether the retry policy should be consulted.
    pub fn is_retryable(&self) -> bool {
        self.kind == StageErrorKind::Retryable
    }

    /// Machine-readable code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<MapError> for StageError {
    fn from(err: MapError) -> Self {
        let code = match err {
            MapError::MissingKey { .. } => codes::MISSING_KEY,
            MapError::TypeMismatch { .. } => codes::TYPE_MISMATCH,
            MapError::Serialization { .. } => codes::STAGE_FATAL,
        };
        StageError::fatal(err.to_string()).with_code(code)
    }
}

/// Result of a stage action.
pub type StageResult = Result<(), StageError>;

/// One unit of work within a workflow.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name used in logs and captured errors.
    fn name(&self) -> &str;

    /// Perform the forward action.
    async fn run(&self, ctx: &mut StageContext) -> StageResult;

    /// Undo whatever `run` may have done, including a partial run.
    ///
    /// Defaults to doing nothing, for stages without side effects.
    async fn compensate(&self, _ctx: &mut StageContext) -> StageResult {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_kind_and_code() {
        let err = StageError::retryable("bucket not ready");
        assert!(err.is_retryable());
        assert_eq!(err.code(), codes::STAGE_RETRYABLE);
        assert_eq!(err.to_string(), "[STAGE_RETRYABLE] bucket not ready");

        let err = StageError::fatal("bad request");
        assert_eq!(err.kind(), StageErrorKind::Fatal);
        assert_eq!(err.code(), codes::STAGE_FATAL);
    }

    #[test]
    fn test_into_fatal_keeps_code() {
        let err = StageError::retryable("held by other")
            .with_code(codes::RESOURCE_LOCKED)
            .into_fatal();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), codes::RESOURCE_LOCKED);
        assert_eq!(err.message(), "held by other");
    }

    #[test]
    fn test_map_errors_are_fatal() {
        let err: StageError = MapError::MissingKey {
            key: "dataset_id".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), codes::MISSING_KEY);
    }
}
