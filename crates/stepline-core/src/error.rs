// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stepline-core.
//!
//! [`EngineError`] is returned from the engine's public API. Failures inside
//! stages never surface here; they are captured on the instance record
//! instead (see [`crate::stage::StageError`]).

use crate::value::MapError;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by engine and persistence operations.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The workflow type is unknown or its definition could not be built
    /// from the supplied parameters. No instance is created.
    #[error("invalid workflow '{workflow_type}': {reason}")]
    InvalidWorkflow {
        /// The requested workflow type.
        workflow_type: String,
        /// Why the definition could not be built.
        reason: String,
    },

    /// The submitted parameter map is absent or malformed.
    #[error("malformed workflow parameter map: {reason}")]
    WorkflowMap {
        /// What is wrong with the map.
        reason: String,
    },

    /// No instance with this id exists.
    #[error("instance '{instance_id}' not found")]
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// Typed parameter access failed.
    #[error(transparent)]
    Map(#[from] MapError),

    /// Persisted state could not be read back.
    #[error("corrupt record for instance '{instance_id}': {details}")]
    CorruptRecord {
        /// The instance whose row is unreadable.
        instance_id: String,
        /// What failed to parse.
        details: String,
    },

    /// Database operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The engine could not be assembled from its configuration.
    #[error("configuration error: {reason}")]
    Configuration {
        /// What is missing or invalid.
        reason: String,
    },

    /// The engine has been shut down and accepts no more work.
    #[error("engine is shut down")]
    ShuttingDown,

    /// A bounded wait elapsed before the instance finished.
    #[error("timed out waiting for instance '{instance_id}'")]
    WaitTimeout {
        /// The instance being waited on.
        instance_id: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidWorkflow { .. } => "INVALID_WORKFLOW",
            Self::WorkflowMap { .. } => "WORKFLOW_MAP",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::Map(MapError::TypeMismatch { .. }) => "TYPE_MISMATCH",
            Self::Map(MapError::MissingKey { .. }) => "MISSING_KEY",
            Self::Map(MapError::Serialization { .. }) => "SERIALIZATION_ERROR",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::WaitTimeout { .. } => "WAIT_TIMEOUT",
        }
    }
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(err: crate::config::ConfigError) -> Self {
        EngineError::Configuration {
            reason: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
