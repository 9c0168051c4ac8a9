// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Operations are exposed as free functions over a [`PgPool`] so callers
//! holding a bare pool can use them; [`PostgresPersistence`] delegates to
//! them.

use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::context::Direction;
use crate::error::{EngineError, Result};
use crate::migrations;
use crate::value::ParamMap;

use super::{
    INSTANCE_COLUMNS, InstanceError, InstanceRecord, InstanceRow, InstanceStatus, Persistence,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Wrap an existing pool. Migrations must already have been applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, then run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| EngineError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        migrations::run_postgres(&pool)
            .await
            .map_err(|e| EngineError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Instance Operations
// ============================================================================

/// Insert a new instance record.
pub async fn create_instance(pool: &PgPool, record: &InstanceRecord) -> Result<()> {
    let result_map = record.result_map.as_ref().map(ParamMap::to_json).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO workflow_instances (
            instance_id, workflow_type, input_parameters, working_map, stage_index,
            direction, status, error_code, error_message, error_stage, result_map,
            created_at, updated_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(&record.instance_id)
    .bind(&record.workflow_type)
    .bind(record.input_parameters.to_json()?)
    .bind(record.working_map.to_json()?)
    .bind(record.stage_index)
    .bind(record.direction.as_str())
    .bind(record.status.as_str())
    .bind(record.error.as_ref().map(|e| e.code.as_str()))
    .bind(record.error.as_ref().map(|e| e.message.as_str()))
    .bind(record.error.as_ref().and_then(|e| e.stage_index))
    .bind(result_map)
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(record.completed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get an instance by ID.
pub async fn get_instance(pool: &PgPool, instance_id: &str) -> Result<Option<InstanceRecord>> {
    let sql = format!(
        "SELECT {} FROM workflow_instances WHERE instance_id = $1",
        INSTANCE_COLUMNS
    );
    let row = sqlx::query_as::<_, InstanceRow>(&sql)
        .bind(instance_id)
        .fetch_optional(pool)
        .await?;

    row.map(InstanceRecord::try_from).transpose()
}

/// Checkpoint position and working map.
pub async fn update_progress(
    pool: &PgPool,
    instance_id: &str,
    stage_index: i32,
    direction: Direction,
    working_map: &ParamMap,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET stage_index = $1,
            direction = $2,
            working_map = $3,
            updated_at = NOW()
        WHERE instance_id = $4
        "#,
    )
    .bind(stage_index)
    .bind(direction.as_str())
    .bind(working_map.to_json()?)
    .bind(instance_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        });
    }
    Ok(())
}

/// Flip to compensation and record the forward error in one statement.
pub async fn begin_undo(
    pool: &PgPool,
    instance_id: &str,
    stage_index: i32,
    working_map: &ParamMap,
    error: &InstanceError,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET stage_index = $1,
            direction = 'undo',
            working_map = $2,
            status = 'running',
            error_code = $3,
            error_message = $4,
            error_stage = $5,
            updated_at = NOW()
        WHERE instance_id = $6
        "#,
    )
    .bind(stage_index)
    .bind(working_map.to_json()?)
    .bind(&error.code)
    .bind(&error.message)
    .bind(error.stage_index)
    .bind(instance_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        });
    }
    Ok(())
}

/// Change status, keeping any previously captured error when `error` is `None`.
pub async fn update_status(
    pool: &PgPool,
    instance_id: &str,
    status: InstanceStatus,
    error: Option<&InstanceError>,
    result_map: Option<&ParamMap>,
) -> Result<()> {
    let result_map = result_map.map(ParamMap::to_json).transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET status = $1,
            error_code = COALESCE($2, error_code),
            error_message = CASE WHEN $2::text IS NULL THEN error_message ELSE $3 END,
            error_stage = CASE WHEN $2::text IS NULL THEN error_stage ELSE $4 END,
            result_map = COALESCE($5, result_map),
            completed_at = CASE WHEN $6 THEN COALESCE(completed_at, NOW()) ELSE completed_at END,
            updated_at = NOW()
        WHERE instance_id = $7
        "#,
    )
    .bind(status.as_str())
    .bind(error.map(|e| e.code.as_str()))
    .bind(error.map(|e| e.message.as_str()))
    .bind(error.and_then(|e| e.stage_index))
    .bind(result_map)
    .bind(status.is_terminal())
    .bind(instance_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        });
    }
    Ok(())
}

/// Instances still `queued` or `running`, oldest first.
pub async fn load_incomplete(pool: &PgPool) -> Result<Vec<InstanceRecord>> {
    let sql = format!(
        "SELECT {} FROM workflow_instances \
         WHERE status IN ('queued', 'running') \
         ORDER BY created_at ASC, instance_id ASC",
        INSTANCE_COLUMNS
    );
    let rows = sqlx::query_as::<_, InstanceRow>(&sql)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(InstanceRecord::try_from).collect()
}

/// List instances, newest first.
pub async fn list_instances(
    pool: &PgPool,
    status: Option<InstanceStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<InstanceRecord>> {
    let sql = format!(
        "SELECT {} FROM workflow_instances \
         WHERE ($1::text IS NULL OR status = $1) \
         ORDER BY created_at DESC, instance_id DESC \
         LIMIT $2 OFFSET $3",
        INSTANCE_COLUMNS
    );
    let rows = sqlx::query_as::<_, InstanceRow>(&sql)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(InstanceRecord::try_from).collect()
}

// ============================================================================
// Lock Operations
// ============================================================================

/// Take `key` for `instance_id` unless another instance holds it.
pub async fn try_acquire_lock(pool: &PgPool, key: &str, instance_id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO resource_locks (resource_key, owner_instance_id, acquired_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (resource_key) DO UPDATE
        SET owner_instance_id = EXCLUDED.owner_instance_id,
            acquired_at = EXCLUDED.acquired_at
        WHERE resource_locks.owner_instance_id IS NULL
           OR resource_locks.owner_instance_id = EXCLUDED.owner_instance_id
        "#,
    )
    .bind(key)
    .bind(instance_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Free `key` if `instance_id` holds it.
pub async fn release_lock(pool: &PgPool, key: &str, instance_id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE resource_locks
        SET owner_instance_id = NULL, acquired_at = NULL
        WHERE resource_key = $1 AND owner_instance_id = $2
        "#,
    )
    .bind(key)
    .bind(instance_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Current owner of `key`.
pub async fn lock_owner(pool: &PgPool, key: &str) -> Result<Option<String>> {
    let owner: Option<(Option<String>,)> =
        sqlx::query_as("SELECT owner_instance_id FROM resource_locks WHERE resource_key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(owner.and_then(|(o,)| o))
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        create_instance(&self.pool, record).await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        get_instance(&self.pool, instance_id).await
    }

    async fn update_progress(
        &self,
        instance_id: &str,
        stage_index: i32,
        direction: Direction,
        working_map: &ParamMap,
    ) -> Result<()> {
        update_progress(&self.pool, instance_id, stage_index, direction, working_map).await
    }

    async fn begin_undo(
        &self,
        instance_id: &str,
        stage_index: i32,
        working_map: &ParamMap,
        error: &InstanceError,
    ) -> Result<()> {
        begin_undo(&self.pool, instance_id, stage_index, working_map, error).await
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        error: Option<&InstanceError>,
        result_map: Option<&ParamMap>,
    ) -> Result<()> {
        update_status(&self.pool, instance_id, status, error, result_map).await
    }

    async fn load_incomplete(&self) -> Result<Vec<InstanceRecord>> {
        load_incomplete(&self.pool).await
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>> {
        list_instances(&self.pool, status, limit, offset).await
    }

    async fn try_acquire_lock(&self, key: &str, instance_id: &str) -> Result<bool> {
        try_acquire_lock(&self.pool, key, instance_id).await
    }

    async fn release_lock(&self, key: &str, instance_id: &str) -> Result<bool> {
        release_lock(&self.pool, key, instance_id).await
    }

    async fn lock_owner(&self, key: &str) -> Result<Option<String>> {
        lock_owner(&self.pool, key).await
    }

    async fn health_check_db(&self) -> Result<bool> {
        let result: std::result::Result<(i32,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
