// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `dataset.data_delete`: soft-delete rows listed in external files.
//!
//! The dataset lock keeps concurrent deletes (and other lock-holding data
//! changes) from interleaving. Each requested table gets an external table
//! over its row-id file, named with a suffix derived from the instance id so
//! concurrent or retried instances never collide. Rows are marked deleted,
//! then the external tables are dropped.

use std::sync::Arc;

use async_trait::async_trait;
use stepline_core::{
    AcquireLockStage, BuildError, ParamMap, ReleaseLockStage, Stage, StageContext, StageResult,
    WorkflowDefinition,
};
use tracing::{debug, info, warn};

use crate::capability::{Capabilities, CapabilityError, Catalog, QueryEngine};
use crate::flights::{dataset_lock_key, parse_request, respond};
use crate::keys;
use crate::model::{DataDeleteRequest, DataDeleteResponse, Dataset};

/// Build a `dataset.data_delete` definition for the request in `params`.
pub fn definition(
    capabilities: &Capabilities,
    params: &ParamMap,
) -> Result<WorkflowDefinition, BuildError> {
    let request: DataDeleteRequest = parse_request(params)?;
    request.validate().map_err(BuildError::Invalid)?;
    let request = Arc::new(request);
    let lock_key = dataset_lock_key(&request.dataset_id);

    let tables = |request: &Arc<DataDeleteRequest>| ExternalTables {
        catalog: capabilities.catalog.clone(),
        query_engine: capabilities.query_engine.clone(),
        request: request.clone(),
    };

    let mut definition = WorkflowDefinition::new();
    definition
        .add_stage_with_retry(
            AcquireLockStage::new(capabilities.persistence.clone(), lock_key.clone()),
            capabilities.lock_retry,
        )
        .add_stage(CreateExternalTablesStage(tables(&request)))
        .add_stage_with_retry(
            ApplySoftDeletesStage(tables(&request)),
            capabilities.call_retry,
        )
        .add_stage_with_retry(
            DropExternalTablesStage(tables(&request)),
            capabilities.call_retry,
        )
        .add_stage(ReleaseLockStage::new(
            capabilities.persistence.clone(),
            lock_key,
        ))
        .add_stage(DataDeleteResponseStage {
            dataset_id: request.dataset_id,
        });
    Ok(definition)
}

/// Name of the external table holding row ids for `table`.
pub fn external_table_name(table: &str, instance_id: &str) -> String {
    format!("{}_delete_{}", table, instance_id.replace('-', "_"))
}

/// What the external-table stages share.
pub struct ExternalTables {
    catalog: Arc<dyn Catalog>,
    query_engine: Arc<dyn QueryEngine>,
    request: Arc<DataDeleteRequest>,
}

impl ExternalTables {
    async fn dataset(&self) -> Result<Dataset, CapabilityError> {
        self.catalog.retrieve(self.request.dataset_id).await
    }

    fn validate_tables(&self, dataset: &Dataset) -> Result<(), CapabilityError> {
        let missing: Vec<&str> = self
            .request
            .tables
            .iter()
            .filter(|spec| dataset.table(&spec.table).is_none())
            .map(|spec| spec.table.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CapabilityError::not_found(
                "table",
                format!("{} (dataset {})", missing.join(", "), dataset.name),
            ))
        }
    }
}

/// Creates one external table per requested table.
pub struct CreateExternalTablesStage(ExternalTables);

#[async_trait]
impl Stage for CreateExternalTablesStage {
    fn name(&self) -> &str {
        "create_external_tables"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let dataset = self.0.dataset().await?;
        self.0.validate_tables(&dataset)?;

        for spec in &self.0.request.tables {
            let name = external_table_name(&spec.table, ctx.instance_id());
            match self
                .0
                .query_engine
                .create_external_table(&dataset, &name, &spec.source_path)
                .await
            {
                Ok(()) => debug!(table = %name, "External table created"),
                // The suffix is unique to this instance.
                Err(CapabilityError::Conflict(_)) => {
                    debug!(table = %name, "External table already exists")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn compensate(&self, ctx: &mut StageContext) -> StageResult {
        let dataset = match self.0.dataset().await {
            Ok(dataset) => dataset,
            Err(CapabilityError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for spec in &self.0.request.tables {
            let name = external_table_name(&spec.table, ctx.instance_id());
            if let Err(e) = self.0.query_engine.drop_table(&dataset, &name).await {
                warn!(
                    table = %name,
                    dataset = %dataset.name,
                    error = %e,
                    "Couldn't clean up external table"
                );
            }
        }
        Ok(())
    }
}

/// Marks the listed rows deleted.
pub struct ApplySoftDeletesStage(ExternalTables);

#[async_trait]
impl Stage for ApplySoftDeletesStage {
    fn name(&self) -> &str {
        "apply_soft_deletes"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let dataset = self.0.dataset().await?;

        let mut total = 0u64;
        for spec in &self.0.request.tables {
            let external = external_table_name(&spec.table, ctx.instance_id());
            let rows = self
                .0
                .query_engine
                .apply_soft_deletes(&dataset, &spec.table, &external)
                .await?;
            debug!(table = %spec.table, rows, "Soft deletes applied");
            total += rows;
        }

        info!(dataset_id = %dataset.id, rows = total, "Rows soft-deleted");
        ctx.working_map_mut().put_typed(keys::ROWS_DELETED, &total)?;
        Ok(())
    }
}

/// Drops the external tables once the deletes are applied.
pub struct DropExternalTablesStage(ExternalTables);

#[async_trait]
impl Stage for DropExternalTablesStage {
    fn name(&self) -> &str {
        "drop_external_tables"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let dataset = self.0.dataset().await?;
        let mut dropped = 0usize;
        for spec in &self.0.request.tables {
            let name = external_table_name(&spec.table, ctx.instance_id());
            if self.0.query_engine.drop_table(&dataset, &name).await? {
                dropped += 1;
            }
        }
        debug!(dropped, "External tables dropped");
        Ok(())
    }
}

/// Stores a [`DataDeleteResponse`] as the response.
pub struct DataDeleteResponseStage {
    dataset_id: uuid::Uuid,
}

#[async_trait]
impl Stage for DataDeleteResponseStage {
    fn name(&self) -> &str {
        "data_delete_response"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let rows_deleted: u64 = ctx.working_map().get_typed(keys::ROWS_DELETED)?;
        respond(
            ctx,
            &DataDeleteResponse {
                dataset_id: self.dataset_id,
                rows_deleted,
            },
        )
    }
}
