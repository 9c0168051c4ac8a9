// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External services the data-repository stages call.
//!
//! The engine never calls these itself. Each trait is implemented by an
//! adapter over a real service (object storage, a query engine, an identity
//! provider, the metadata catalog) and injected through [`Capabilities`].
//!
//! Every call reports failures as [`CapabilityError`]. Only
//! [`CapabilityError::Transient`] is worth retrying; the conversion into
//! [`StageError`] encodes that, so stages can use `?` directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stepline_core::stage::codes as stage_codes;
use stepline_core::{Persistence, RetryPolicy, StageError};
use uuid::Uuid;

use crate::model::{Dataset, FileInfo, FileRecord, ObjectLocation, ResourceRef};

/// Error codes attached to capability failures.
pub mod codes {
    /// The service could not be reached or asked us to back off.
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    /// The referenced object does not exist.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// The object exists and belongs to someone else.
    pub const CONFLICT: &str = "CONFLICT";
    /// The caller lacks permission.
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    /// The service rejected the request.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

/// Failure reported by an external service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// Timeouts, throttling, 5xx responses.
    #[error("service unavailable: {0}")]
    Transient(String),

    /// The referenced object does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Object kind, e.g. `dataset`.
        kind: &'static str,
        /// Object id or name.
        id: String,
    },

    /// The object already exists and is owned by someone else.
    #[error("{0}")]
    Conflict(String),

    /// The object is locked by another workflow.
    #[error("{resource} is locked by {holder}")]
    Locked {
        /// What is locked.
        resource: String,
        /// Current holder.
        holder: String,
    },

    /// The caller lacks permission.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The service rejected the request.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl CapabilityError {
    /// Shorthand for [`CapabilityError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => codes::SERVICE_UNAVAILABLE,
            Self::NotFound { .. } => codes::NOT_FOUND,
            Self::Conflict(_) => codes::CONFLICT,
            Self::Locked { .. } => stage_codes::RESOURCE_LOCKED,
            Self::Unauthorized(_) => codes::UNAUTHORIZED,
            Self::Invalid(_) => codes::INVALID_REQUEST,
        }
    }
}

impl From<CapabilityError> for StageError {
    fn from(err: CapabilityError) -> Self {
        let code = err.code();
        if err.is_transient() {
            StageError::retryable(err.to_string()).with_code(code)
        } else {
            StageError::fatal(err.to_string()).with_code(code)
        }
    }
}

/// Result of a capability call.
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Copies objects into repository storage.
#[async_trait]
pub trait ObjectMover: Send + Sync {
    /// Copy `source` to `target`, overwriting any earlier partial copy.
    async fn copy(&self, source: &str, target: &ObjectLocation) -> CapabilityResult<FileInfo>;

    /// Delete `target`. Returns `false` if it did not exist.
    async fn delete(&self, target: &ObjectLocation) -> CapabilityResult<bool>;
}

/// Manages the query-engine side of a dataset.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Create the dataset and its tables. Fails with `Conflict` if it exists.
    async fn create_dataset(&self, dataset: &Dataset) -> CapabilityResult<()>;

    /// Drop the dataset and its tables. Returns `false` if it did not exist.
    async fn drop_dataset(&self, dataset: &Dataset) -> CapabilityResult<bool>;

    /// Create `table_name` as an external table over `source_path`.
    /// Fails with `Conflict` if the table exists.
    async fn create_external_table(
        &self,
        dataset: &Dataset,
        table_name: &str,
        source_path: &str,
    ) -> CapabilityResult<()>;

    /// Mark the rows of `table` whose ids appear in `external_table` as
    /// deleted. Returns the number of rows marked. Marking is idempotent.
    async fn apply_soft_deletes(
        &self,
        dataset: &Dataset,
        table: &str,
        external_table: &str,
    ) -> CapabilityResult<u64>;

    /// Drop a table. Returns `false` if it did not exist.
    async fn drop_table(&self, dataset: &Dataset, table_name: &str) -> CapabilityResult<bool>;
}

/// Manages authorization resources and role grants.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Create the resource. Creating an existing resource succeeds.
    async fn create_resource(&self, resource: &ResourceRef) -> CapabilityResult<()>;

    /// Delete the resource and its grants.
    async fn delete_resource(&self, resource: &ResourceRef) -> CapabilityResult<()>;

    /// Grant `role` on `resource` to `member`. Granting twice succeeds.
    async fn grant_role(
        &self,
        resource: &ResourceRef,
        role: &str,
        member: &str,
    ) -> CapabilityResult<()>;

    /// Whether `member` holds `role` on `resource`.
    async fn has_role(
        &self,
        resource: &ResourceRef,
        role: &str,
        member: &str,
    ) -> CapabilityResult<bool>;
}

/// The metadata catalog: datasets, files and object locks.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Insert a dataset record. Fails with `Conflict` if the name is taken.
    async fn create_dataset(&self, dataset: &Dataset) -> CapabilityResult<()>;

    /// Fetch a dataset by id.
    async fn retrieve(&self, id: Uuid) -> CapabilityResult<Dataset>;

    /// Fetch a dataset by name, if present.
    async fn retrieve_by_name(&self, name: &str) -> CapabilityResult<Option<Dataset>>;

    /// Delete a dataset record. Returns `false` if it did not exist.
    async fn delete_dataset(&self, id: Uuid) -> CapabilityResult<bool>;

    /// Lock a catalog object for `flight_id`. Locking again with the same
    /// flight id succeeds; another holder yields `Locked`.
    async fn lock(&self, object_id: Uuid, flight_id: &str) -> CapabilityResult<()>;

    /// Unlock an object held by `flight_id`. Returns `false` if it was not
    /// held by that flight.
    async fn unlock(&self, object_id: Uuid, flight_id: &str) -> CapabilityResult<bool>;

    /// Insert a file record. Fails with `Conflict` if the path is taken.
    async fn create_file(&self, record: &FileRecord) -> CapabilityResult<()>;

    /// Fetch the file record at `path` in a dataset, if present.
    async fn lookup_file(&self, dataset_id: Uuid, path: &str)
    -> CapabilityResult<Option<FileRecord>>;

    /// Delete the file record at `path`. Returns `false` if it did not exist.
    async fn delete_file(&self, dataset_id: Uuid, path: &str) -> CapabilityResult<bool>;
}

/// Everything the data-repository workflows need, shared by all instances.
#[derive(Clone)]
pub struct Capabilities {
    /// Engine store, used by the resource lock stages.
    pub persistence: Arc<dyn Persistence>,
    /// Metadata catalog.
    pub catalog: Arc<dyn Catalog>,
    /// Query engine.
    pub query_engine: Arc<dyn QueryEngine>,
    /// Object storage.
    pub object_mover: Arc<dyn ObjectMover>,
    /// Identity and access.
    pub authorizer: Arc<dyn Authorizer>,
    /// Policy for waiting on a contended resource lock.
    pub lock_retry: RetryPolicy,
    /// Policy for the file copy.
    pub copy_retry: RetryPolicy,
    /// Policy for other service calls.
    pub call_retry: RetryPolicy,
}

impl Capabilities {
    /// Bundle the services with the default retry policies.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        catalog: Arc<dyn Catalog>,
        query_engine: Arc<dyn QueryEngine>,
        object_mover: Arc<dyn ObjectMover>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            persistence,
            catalog,
            query_engine,
            object_mover,
            authorizer,
            lock_retry: RetryPolicy::random(Duration::from_millis(500), 8, 5),
            copy_retry: RetryPolicy::exponential(
                Duration::from_secs(5),
                Duration::from_secs(20),
                Duration::from_secs(600),
            ),
            call_retry: RetryPolicy::fixed(3, Duration::from_secs(1)),
        }
    }

    /// Replace the lock retry policy.
    pub fn with_lock_retry(mut self, retry: RetryPolicy) -> Self {
        self.lock_retry = retry;
        self
    }

    /// Replace the copy retry policy.
    pub fn with_copy_retry(mut self, retry: RetryPolicy) -> Self {
        self.copy_retry = retry;
        self
    }

    /// Replace the policy for other service calls.
    pub fn with_call_retry(mut self, retry: RetryPolicy) -> Self {
        self.call_retry = retry;
        self
    }
}
