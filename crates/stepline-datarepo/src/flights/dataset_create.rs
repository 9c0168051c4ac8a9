// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `dataset.create`: catalog record, query-engine dataset, authorization
//! resource, response.
//!
//! The catalog record is written first and owned by the instance id, so
//! every later stage (and every undo) can find the dataset by id, and a
//! rerun after a crash recognises its own record instead of reporting a
//! name conflict.

use std::sync::Arc;

use async_trait::async_trait;
use stepline_core::{BuildError, ParamMap, Stage, StageContext, StageResult, WorkflowDefinition};
use tracing::{debug, info, warn};

use crate::capability::{Authorizer, Capabilities, CapabilityError, Catalog, QueryEngine};
use crate::flights::{parse_request, respond};
use crate::keys;
use crate::model::{Dataset, DatasetRequest, DatasetSummary, ResourceRef, roles};

/// Build a `dataset.create` definition for the request in `params`.
pub fn definition(
    capabilities: &Capabilities,
    params: &ParamMap,
) -> Result<WorkflowDefinition, BuildError> {
    let request: DatasetRequest = parse_request(params)?;
    request.validate().map_err(BuildError::Invalid)?;
    let request = Arc::new(request);

    let mut definition = WorkflowDefinition::new();
    definition
        .add_stage_with_retry(
            CreateMetadataStage {
                catalog: capabilities.catalog.clone(),
                request: request.clone(),
            },
            capabilities.call_retry,
        )
        .add_stage_with_retry(
            CreatePrimaryDataStage {
                catalog: capabilities.catalog.clone(),
                query_engine: capabilities.query_engine.clone(),
            },
            capabilities.call_retry,
        )
        .add_stage_with_retry(
            CreateAuthzResourceStage {
                authorizer: capabilities.authorizer.clone(),
                request: request.clone(),
            },
            capabilities.call_retry,
        )
        .add_stage(DatasetResponseStage {
            catalog: capabilities.catalog.clone(),
        });
    Ok(definition)
}

/// Writes the dataset record and stores its id in the working map.
pub struct CreateMetadataStage {
    catalog: Arc<dyn Catalog>,
    request: Arc<DatasetRequest>,
}

#[async_trait]
impl Stage for CreateMetadataStage {
    fn name(&self) -> &str {
        "create_dataset_metadata"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let flight_id = ctx.instance_id().to_string();

        let id = match self.catalog.retrieve_by_name(&self.request.name).await? {
            Some(existing) if existing.created_by == flight_id => {
                debug!(
                    dataset_id = %existing.id,
                    "Dataset record already written by this instance"
                );
                existing.id
            }
            Some(existing) => {
                return Err(CapabilityError::Conflict(format!(
                    "dataset '{}' already exists",
                    existing.name
                ))
                .into());
            }
            None => {
                let dataset = Dataset::from_request(&self.request, &flight_id);
                self.catalog.create_dataset(&dataset).await?;
                info!(dataset_id = %dataset.id, name = %dataset.name, "Dataset record created");
                dataset.id
            }
        };

        ctx.working_map_mut().put(keys::DATASET_ID, id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut StageContext) -> StageResult {
        match self.catalog.retrieve_by_name(&self.request.name).await? {
            Some(existing) if existing.created_by == ctx.instance_id() => {
                self.catalog.delete_dataset(existing.id).await?;
                info!(dataset_id = %existing.id, "Dataset record deleted");
            }
            _ => debug!(name = %self.request.name, "No dataset record owned by this instance"),
        }
        Ok(())
    }
}

/// Creates the dataset and its tables in the query engine.
pub struct CreatePrimaryDataStage {
    catalog: Arc<dyn Catalog>,
    query_engine: Arc<dyn QueryEngine>,
}

#[async_trait]
impl Stage for CreatePrimaryDataStage {
    fn name(&self) -> &str {
        "create_primary_data"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let dataset = self
            .catalog
            .retrieve(ctx.working_map().get_uuid(keys::DATASET_ID)?)
            .await?;

        match self.query_engine.create_dataset(&dataset).await {
            Ok(()) => info!(
                dataset_id = %dataset.id,
                tables = dataset.tables.len(),
                "Primary dataset created"
            ),
            // Names are unique in the catalog, so an existing one is ours.
            Err(CapabilityError::Conflict(_)) => {
                debug!(dataset_id = %dataset.id, "Primary dataset already exists")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn compensate(&self, ctx: &mut StageContext) -> StageResult {
        let Some(id) = ctx.working_map().get_opt_uuid(keys::DATASET_ID)? else {
            return Ok(());
        };
        let dataset = match self.catalog.retrieve(id).await {
            Ok(dataset) => dataset,
            Err(CapabilityError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if self.query_engine.drop_dataset(&dataset).await? {
            info!(dataset_id = %id, "Primary dataset dropped");
        }
        Ok(())
    }
}

/// Creates the dataset's authorization resource and grants stewards.
pub struct CreateAuthzResourceStage {
    authorizer: Arc<dyn Authorizer>,
    request: Arc<DatasetRequest>,
}

#[async_trait]
impl Stage for CreateAuthzResourceStage {
    fn name(&self) -> &str {
        "create_dataset_authz"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let resource = ResourceRef::dataset(ctx.working_map().get_uuid(keys::DATASET_ID)?);
        self.authorizer.create_resource(&resource).await?;
        for steward in &self.request.stewards {
            self.authorizer
                .grant_role(&resource, roles::STEWARD, steward)
                .await?;
        }
        Ok(())
    }

    async fn compensate(&self, ctx: &mut StageContext) -> StageResult {
        let Some(id) = ctx.working_map().get_opt_uuid(keys::DATASET_ID)? else {
            return Ok(());
        };
        let resource = ResourceRef::dataset(id);
        match self.authorizer.delete_resource(&resource).await {
            Ok(()) => Ok(()),
            Err(e @ (CapabilityError::NotFound { .. } | CapabilityError::Unauthorized(_))) => {
                warn!(
                    resource = %resource,
                    error = %e,
                    "Ignoring failure to delete authorization resource"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Stores a [`DatasetSummary`] as the response.
pub struct DatasetResponseStage {
    catalog: Arc<dyn Catalog>,
}

#[async_trait]
impl Stage for DatasetResponseStage {
    fn name(&self) -> &str {
        "dataset_response"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let dataset = self
            .catalog
            .retrieve(ctx.working_map().get_uuid(keys::DATASET_ID)?)
            .await?;
        respond(ctx, &DatasetSummary::from(&dataset))
    }
}
