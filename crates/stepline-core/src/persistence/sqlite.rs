// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::context::Direction;
use crate::error::{EngineError, Result};
use crate::migrations;
use crate::value::ParamMap;

use super::{
    INSTANCE_COLUMNS, InstanceError, InstanceRecord, InstanceRow, InstanceStatus, Persistence,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Wrap an existing pool. Migrations must already have been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, then run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| EngineError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite: {}", e),
            })?;

        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) the database file at `path`.
    ///
    /// Parent directories are created as well.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    migrations::run_sqlite(pool)
        .await
        .map_err(|e| EngineError::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })
}

fn not_found(instance_id: &str) -> EngineError {
    EngineError::InstanceNotFound {
        instance_id: instance_id.to_string(),
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        let result_map = record.result_map.as_ref().map(ParamMap::to_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances (
                instance_id, workflow_type, input_parameters, working_map, stage_index,
                direction, status, error_code, error_message, error_stage, result_map,
                created_at, updated_at, completed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let sql = format!(
            "SELECT {} FROM workflow_instances WHERE instance_id = ?1",
            INSTANCE_COLUMNS
        );
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn update_progress(
        &self,
        instance_id: &str,
        stage_index: i32,
        direction: Direction,
        working_map: &ParamMap,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET stage_index = ?1,
                direction = ?2,
                working_map = ?3,
                updated_at = ?4
            WHERE instance_id = ?5
            "#,
        )
        .bind(stage_index)
        .bind(direction.as_str())
        .bind(working_map.to_json()?)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(instance_id));
        }
        Ok(())
    }

    async fn begin_undo(
        &self,
        instance_id: &str,
        stage_index: i32,
        working_map: &ParamMap,
        error: &InstanceError,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET stage_index = ?1,
                direction = 'undo',
                working_map = ?2,
                status = 'running',
                error_code = ?3,
                error_message = ?4,
                error_stage = ?5,
                updated_at = ?6
            WHERE instance_id = ?7
            "#,
        )
        .bind(stage_index)
        .bind(working_map.to_json()?)
        .bind(&error.code)
        .bind(&error.message)
        .bind(error.stage_index)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(instance_id));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        error: Option<&InstanceError>,
        result_map: Option<&ParamMap>,
    ) -> Result<()> {
        let result_map = result_map.map(ParamMap::to_json).transpose()?;
        let now = Utc::now();
        let completed_at = status.is_terminal().then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?1,
                error_code = COALESCE(?2, error_code),
                error_message = CASE WHEN ?2 IS NULL THEN error_message ELSE ?3 END,
                error_stage = CASE WHEN ?2 IS NULL THEN error_stage ELSE ?4 END,
                result_map = COALESCE(?5, result_map),
                completed_at = COALESCE(?6, completed_at),
                updated_at = ?7
            WHERE instance_id = ?8
            "#,
        )
        .bind(status.as_str())
        .bind(error.map(|e| e.code.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(error.and_then(|e| e.stage_index))
        .bind(result_map)
        .bind(completed_at)
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(instance_id));
        }
        Ok(())
    }

    async fn load_incomplete(&self) -> Result<Vec<InstanceRecord>> {
        let sql = format!(
            "SELECT {} FROM workflow_instances \
             WHERE status IN ('queued', 'running') \
             ORDER BY created_at ASC, instance_id ASC",
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>> {
        let sql = format!(
            "SELECT {} FROM workflow_instances \
             WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY created_at DESC, instance_id DESC \
             LIMIT ?2 OFFSET ?3",
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    async fn try_acquire_lock(&self, key: &str, instance_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO resource_locks (resource_key, owner_instance_id, acquired_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (resource_key) DO UPDATE
            SET owner_instance_id = excluded.owner_instance_id,
                acquired_at = excluded.acquired_at
            WHERE resource_locks.owner_instance_id IS NULL
               OR resource_locks.owner_instance_id = excluded.owner_instance_id
            "#,
        )
        .bind(key)
        .bind(instance_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, key: &str, instance_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE resource_locks
            SET owner_instance_id = NULL, acquired_at = NULL
            WHERE resource_key = ?1 AND owner_instance_id = ?2
            "#,
        )
        .bind(key)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn lock_owner(&self, key: &str) -> Result<Option<String>> {
        let owner: Option<(Option<String>,)> =
            sqlx::query_as("SELECT owner_instance_id FROM resource_locks WHERE resource_key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(owner.and_then(|(o,)| o))
    }

    async fn health_check_db(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    async fn persistence() -> SqlitePersistence {
        SqlitePersistence::new(test_pool().await)
    }

    fn record(id: &str) -> InstanceRecord {
        InstanceRecord::new_queued(id, "test.workflow", ParamMap::new().with("dataset", "d1"))
    }

    #[tokio::test]
    async fn test_create_and_get_instance() {
        let p = persistence().await;
        p.create_instance(&record("inst-1")).await.unwrap();

        let loaded = p.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(loaded.workflow_type, "test.workflow");
        assert_eq!(loaded.status, InstanceStatus::Queued);
        assert_eq!(loaded.direction, Direction::Forward);
        assert_eq!(loaded.stage_index, 0);
        assert_eq!(loaded.input_parameters.get_str("dataset").unwrap(), "d1");
        assert!(loaded.working_map.is_empty());
        assert!(loaded.error.is_none());
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_instance() {
        let p = persistence().await;
        assert!(p.get_instance("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_instance_id_fails() {
        let p = persistence().await;
        p.create_instance(&record("dup")).await.unwrap();
        let err = p.create_instance(&record("dup")).await.unwrap_err();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }

    #[tokio::test]
    async fn test_update_progress_roundtrip() {
        let p = persistence().await;
        p.create_instance(&record("inst-1")).await.unwrap();

        let working = ParamMap::new().with("staging", "st_1").with("rows", 42i64);
        p.update_progress("inst-1", 3, Direction::Undo, &working)
            .await
            .unwrap();

        let loaded = p.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(loaded.stage_index, 3);
        assert_eq!(loaded.direction, Direction::Undo);
        assert_eq!(loaded.working_map, working);
    }

    #[tokio::test]
    async fn test_update_progress_unknown_instance() {
        let p = persistence().await;
        let err = p
            .update_progress("ghost", 1, Direction::Forward, &ParamMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_status_keeps_error_and_stamps_completion() {
        let p = persistence().await;
        p.create_instance(&record("inst-1")).await.unwrap();

        p.update_status("inst-1", InstanceStatus::Running, None, None)
            .await
            .unwrap();
        let error = InstanceError {
            code: "STAGE_FATAL".to_string(),
            message: "boom".to_string(),
            stage_index: Some(1),
        };
        p.update_status("inst-1", InstanceStatus::Running, Some(&error), None)
            .await
            .unwrap();
        let running = p.get_instance("inst-1").await.unwrap().unwrap();
        assert!(running.completed_at.is_none());

        p.update_status("inst-1", InstanceStatus::Error, None, None)
            .await
            .unwrap();
        let done = p.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(done.status, InstanceStatus::Error);
        assert_eq!(done.error, Some(error));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_status_replaces_error_columns_together() {
        let p = persistence().await;
        p.create_instance(&record("inst-1")).await.unwrap();

        let staged = InstanceError {
            code: "STAGE_FATAL".to_string(),
            message: "boom".to_string(),
            stage_index: Some(2),
        };
        p.update_status("inst-1", InstanceStatus::Running, Some(&staged), None)
            .await
            .unwrap();
        let unstaged = InstanceError {
            code: "INVALID_WORKFLOW".to_string(),
            message: "no factory registered".to_string(),
            stage_index: None,
        };
        p.update_status("inst-1", InstanceStatus::Fatal, Some(&unstaged), None)
            .await
            .unwrap();

        let loaded = p.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(loaded.error, Some(unstaged));
    }

    #[tokio::test]
    async fn test_begin_undo_writes_position_and_error() {
        let p = persistence().await;
        p.create_instance(&record("inst-1")).await.unwrap();

        let working = ParamMap::new().with("staging", "st_1");
        let error = InstanceError {
            code: "STAGE_FATAL".to_string(),
            message: "load failed".to_string(),
            stage_index: Some(2),
        };
        p.begin_undo("inst-1", 2, &working, &error).await.unwrap();

        let loaded = p.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.direction, Direction::Undo);
        assert_eq!(loaded.stage_index, 2);
        assert_eq!(loaded.working_map, working);
        assert_eq!(loaded.error, Some(error));

        let err = p
            .begin_undo("ghost", 0, &ParamMap::new(), &loaded.error.unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_status_with_result_map() {
        let p = persistence().await;
        p.create_instance(&record("inst-1")).await.unwrap();

        let result = ParamMap::new().with("answer", 42i64);
        p.update_status("inst-1", InstanceStatus::Success, None, Some(&result))
            .await
            .unwrap();

        let loaded = p.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(loaded.result_map, Some(result));
    }

    #[tokio::test]
    async fn test_load_incomplete_filters_terminal() {
        let p = persistence().await;
        for id in ["a", "b", "c"] {
            p.create_instance(&record(id)).await.unwrap();
        }
        p.update_status("b", InstanceStatus::Running, None, None)
            .await
            .unwrap();
        p.update_status("c", InstanceStatus::Fatal, None, None)
            .await
            .unwrap();

        let ids: Vec<String> = p
            .load_incomplete()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.instance_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_list_instances_by_status_with_paging() {
        let p = persistence().await;
        for id in ["a", "b", "c", "d"] {
            p.create_instance(&record(id)).await.unwrap();
        }
        p.update_status("d", InstanceStatus::Success, None, None)
            .await
            .unwrap();

        assert_eq!(p.list_instances(None, 10, 0).await.unwrap().len(), 4);
        assert_eq!(p.list_instances(None, 2, 0).await.unwrap().len(), 2);
        assert_eq!(p.list_instances(None, 10, 3).await.unwrap().len(), 1);

        let queued = p
            .list_instances(Some(InstanceStatus::Queued), 10, 0)
            .await
            .unwrap();
        assert_eq!(queued.len(), 3);
        assert!(queued.iter().all(|r| r.status == InstanceStatus::Queued));
    }

    #[tokio::test]
    async fn test_lock_exclusion_and_reentry() {
        let p = persistence().await;

        assert!(p.try_acquire_lock("load:tag", "inst-1").await.unwrap());
        assert!(p.try_acquire_lock("load:tag", "inst-1").await.unwrap());
        assert!(!p.try_acquire_lock("load:tag", "inst-2").await.unwrap());
        assert_eq!(
            p.lock_owner("load:tag").await.unwrap().as_deref(),
            Some("inst-1")
        );

        // Only the owner may release.
        assert!(!p.release_lock("load:tag", "inst-2").await.unwrap());
        assert!(p.release_lock("load:tag", "inst-1").await.unwrap());
        assert!(!p.release_lock("load:tag", "inst-1").await.unwrap());
        assert!(p.lock_owner("load:tag").await.unwrap().is_none());

        assert!(p.try_acquire_lock("load:tag", "inst-2").await.unwrap());
        assert_eq!(
            p.lock_owner("load:tag").await.unwrap().as_deref(),
            Some("inst-2")
        );
    }

    #[tokio::test]
    async fn test_lock_owner_unknown_key() {
        let p = persistence().await;
        assert!(p.lock_owner("never").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_health_check_db() {
        let p = persistence().await;
        assert!(p.health_check_db().await.unwrap());
    }

    #[tokio::test]
    async fn test_from_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stepline.db");

        let p = SqlitePersistence::from_path(&path).await.unwrap();
        p.create_instance(&record("inst-1")).await.unwrap();

        assert!(path.exists());
        assert!(p.get_instance("inst-1").await.unwrap().is_some());
    }
}
