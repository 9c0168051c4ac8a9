// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for stepline-core.
//!
//! The store is the only structure shared between concurrently running
//! instances. Every mutation is a single statement keyed by instance id or
//! resource key; no transaction spans more than one instance.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::Config;
use crate::context::Direction;
use crate::error::{EngineError, Result};
use crate::value::ParamMap;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    /// Persisted, waiting for a worker.
    Queued,
    /// Owned by a worker and executing (forward or undo).
    Running,
    /// Every stage ran forward successfully.
    Success,
    /// Forward execution failed and compensation completed.
    Error,
    /// Compensation failed; needs operator attention.
    Fatal,
}

impl InstanceStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Parse a status from its stored form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }

    /// Whether the instance will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Fatal)
    }
}

/// Failure captured on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceError {
    /// Machine-readable code (see [`crate::stage::codes`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Stage that produced the failure, if any.
    pub stage_index: Option<i32>,
}

/// A workflow instance as stored.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    /// Unique identifier for the instance.
    pub instance_id: String,
    /// Registered workflow type used to rebuild the definition.
    pub workflow_type: String,
    /// Parameters fixed at submission.
    pub input_parameters: ParamMap,
    /// Working map as of the last checkpoint.
    pub working_map: ParamMap,
    /// Next stage to run (forward) or compensate (undo).
    pub stage_index: i32,
    /// Current direction.
    pub direction: Direction,
    /// Current status.
    pub status: InstanceStatus,
    /// Captured failure, if any.
    pub error: Option<InstanceError>,
    /// Final working map of a successful instance.
    pub result_map: Option<ParamMap>,
    /// When the instance was submitted.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// When the instance reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// A fresh `queued` record positioned at stage 0.
    pub fn new_queued(
        instance_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input_parameters: ParamMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            workflow_type: workflow_type.into(),
            input_parameters,
            working_map: ParamMap::new(),
            stage_index: 0,
            direction: Direction::Forward,
            status: InstanceStatus::Queued,
            error: None,
            result_map: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Raw row shared by the SQL backends.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct InstanceRow {
    pub instance_id: String,
    pub workflow_type: String,
    pub input_parameters: String,
    pub working_map: String,
    pub stage_index: i32,
    pub direction: String,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_stage: Option<i32>,
    pub result_map: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub(crate) const INSTANCE_COLUMNS: &str = "instance_id, workflow_type, input_parameters, \
     working_map, stage_index, direction, status, error_code, error_message, error_stage, \
     result_map, created_at, updated_at, completed_at";

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = EngineError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let corrupt = |details: String| EngineError::CorruptRecord {
            instance_id: row.instance_id.clone(),
            details,
        };

        let input_parameters = ParamMap::from_json(&row.input_parameters)
            .map_err(|e| corrupt(format!("input_parameters: {}", e)))?;
        let working_map = ParamMap::from_json(&row.working_map)
            .map_err(|e| corrupt(format!("working_map: {}", e)))?;
        let result_map = row
            .result_map
            .as_deref()
            .map(ParamMap::from_json)
            .transpose()
            .map_err(|e| corrupt(format!("result_map: {}", e)))?;
        let direction = Direction::parse(&row.direction)
            .ok_or_else(|| corrupt(format!("unknown direction '{}'", row.direction)))?;
        let status = InstanceStatus::parse(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", row.status)))?;
        let error = row.error_code.clone().map(|code| InstanceError {
            code,
            message: row.error_message.clone().unwrap_or_default(),
            stage_index: row.error_stage,
        });

        Ok(Self {
            instance_id: row.instance_id,
            workflow_type: row.workflow_type,
            input_parameters,
            working_map,
            stage_index: row.stage_index,
            direction,
            status,
            error,
            result_map,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Persistence interface used by the engine and the lock stages.
///
/// Implementations must give read-after-write consistency per instance id.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new instance record.
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()>;

    /// Load one instance.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    /// Checkpoint the position and working map of a running instance.
    async fn update_progress(
        &self,
        instance_id: &str,
        stage_index: i32,
        direction: Direction,
        working_map: &ParamMap,
    ) -> Result<()>;

    /// Switch a running instance to compensation at `stage_index`.
    ///
    /// Direction, position, working map and the captured forward error are
    /// written in one statement.
    async fn begin_undo(
        &self,
        instance_id: &str,
        stage_index: i32,
        working_map: &ParamMap,
        error: &InstanceError,
    ) -> Result<()>;

    /// Change status, optionally recording an error and result map.
    ///
    /// Terminal statuses also stamp `completed_at`. Passing `None` for
    /// `error` keeps a previously captured error; `Some` replaces all of
    /// its columns together.
    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        error: Option<&InstanceError>,
        result_map: Option<&ParamMap>,
    ) -> Result<()>;

    /// Every instance that is `queued` or `running`, oldest first.
    async fn load_incomplete(&self) -> Result<Vec<InstanceRecord>>;

    /// List instances, newest first.
    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>>;

    /// Take `key` for `instance_id` if it is free or already held by it.
    ///
    /// Returns false if another instance holds the lock.
    async fn try_acquire_lock(&self, key: &str, instance_id: &str) -> Result<bool>;

    /// Free `key` if `instance_id` holds it. Returns whether a row changed.
    async fn release_lock(&self, key: &str, instance_id: &str) -> Result<bool>;

    /// Current owner of `key`, if any.
    async fn lock_owner(&self, key: &str) -> Result<Option<String>>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool>;
}

/// Open the backend named by `config.database_url` and run its migrations.
///
/// `sqlite:` URLs select [`SqlitePersistence`]; `postgres://` and
/// `postgresql://` select [`PostgresPersistence`].
pub async fn connect(config: &Config) -> Result<Arc<dyn Persistence>> {
    let url = config.database_url.as_str();
    if url.starts_with("sqlite:") {
        info!("Using SQLite persistence");
        let persistence = SqlitePersistence::connect(url, config.max_db_connections).await?;
        Ok(Arc::new(persistence))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        info!("Using PostgreSQL persistence");
        let persistence = PostgresPersistence::connect(url, config.max_db_connections).await?;
        Ok(Arc::new(persistence))
    } else {
        Err(EngineError::Database {
            operation: "connect".to_string(),
            details: "unsupported database URL scheme".to_string(),
        })
    }
}
