// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `file.ingest`: copy one file into a dataset.
//!
//! Stages, in order:
//!
//! 1. check the requester stewards the dataset
//! 2. acquire the load-tag lock (random backoff while another ingest holds it)
//! 3. verify the dataset exists
//! 4. choose the target location and persist it before any bytes move, so
//!    the copy's undo always knows what to delete
//! 5. copy the object (exponential backoff)
//! 6. record file metadata, owned by the instance id
//! 7. release the load-tag lock
//! 8. store the file record as the response

use std::sync::Arc;

use async_trait::async_trait;
use stepline_core::{
    AcquireLockStage, BuildError, ParamMap, ReleaseLockStage, Stage, StageContext, StageResult,
    WorkflowDefinition,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::capability::{Authorizer, Capabilities, CapabilityError, Catalog, ObjectMover};
use crate::flights::{load_lock_key, parse_request, respond};
use crate::keys;
use crate::model::{FileInfo, FileLoadRequest, FileRecord, ObjectLocation, ResourceRef, roles};

/// Build a `file.ingest` definition for the request in `params`.
pub fn definition(
    capabilities: &Capabilities,
    params: &ParamMap,
) -> Result<WorkflowDefinition, BuildError> {
    let request: FileLoadRequest = parse_request(params)?;
    request.validate().map_err(BuildError::Invalid)?;
    let request = Arc::new(request);
    let lock_key = load_lock_key(&request.load_tag);

    let mut definition = WorkflowDefinition::new();
    definition
        .add_stage_with_retry(
            VerifyIngestAccessStage {
                authorizer: capabilities.authorizer.clone(),
                dataset_id: request.dataset_id,
                member: request.requested_by.clone(),
            },
            capabilities.call_retry,
        )
        .add_stage_with_retry(
            AcquireLockStage::new(capabilities.persistence.clone(), lock_key.clone()),
            capabilities.lock_retry,
        )
        .add_stage_with_retry(
            VerifyDatasetStage {
                catalog: capabilities.catalog.clone(),
                dataset_id: request.dataset_id,
            },
            capabilities.call_retry,
        )
        .add_stage(ChooseLocationStage {
            request: request.clone(),
        })
        .add_stage_with_retry(
            CopyFileStage {
                object_mover: capabilities.object_mover.clone(),
                source_path: request.source_path.clone(),
            },
            capabilities.copy_retry,
        )
        .add_stage_with_retry(
            RecordFileStage {
                catalog: capabilities.catalog.clone(),
                request: request.clone(),
            },
            capabilities.call_retry,
        )
        .add_stage(ReleaseLockStage::new(
            capabilities.persistence.clone(),
            lock_key,
        ))
        .add_stage(FileResponseStage {
            catalog: capabilities.catalog.clone(),
            request,
        });
    Ok(definition)
}

/// Bucket holding files paid for by `profile_id`.
pub fn bucket_for_profile(profile_id: &str) -> String {
    format!("datarepo-{}", profile_id)
}

/// Fails the ingest unless `member` holds the steward role on the dataset.
pub struct VerifyIngestAccessStage {
    authorizer: Arc<dyn Authorizer>,
    dataset_id: Uuid,
    member: String,
}

#[async_trait]
impl Stage for VerifyIngestAccessStage {
    fn name(&self) -> &str {
        "verify_ingest_access"
    }

    async fn run(&self, _ctx: &mut StageContext) -> StageResult {
        let resource = ResourceRef::dataset(self.dataset_id);
        if !self
            .authorizer
            .has_role(&resource, roles::STEWARD, &self.member)
            .await?
        {
            return Err(CapabilityError::Unauthorized(format!(
                "{} may not ingest into {}",
                self.member, resource
            ))
            .into());
        }
        Ok(())
    }
}

/// Fails the ingest if the target dataset does not exist.
pub struct VerifyDatasetStage {
    catalog: Arc<dyn Catalog>,
    dataset_id: Uuid,
}

#[async_trait]
impl Stage for VerifyDatasetStage {
    fn name(&self) -> &str {
        "verify_dataset"
    }

    async fn run(&self, _ctx: &mut StageContext) -> StageResult {
        let dataset = self.catalog.retrieve(self.dataset_id).await?;
        debug!(dataset_id = %dataset.id, name = %dataset.name, "Ingest target verified");
        Ok(())
    }
}

/// Picks the file id and storage location.
pub struct ChooseLocationStage {
    request: Arc<FileLoadRequest>,
}

#[async_trait]
impl Stage for ChooseLocationStage {
    fn name(&self) -> &str {
        "choose_location"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let file_id = match ctx.working_map().get_opt_uuid(keys::FILE_ID)? {
            Some(id) => id,
            None => Uuid::new_v4(),
        };
        let location = ObjectLocation {
            bucket: bucket_for_profile(&self.request.profile_id),
            path: format!("{}/{}", self.request.dataset_id, file_id),
        };

        let working = ctx.working_map_mut();
        working.put(keys::FILE_ID, file_id);
        working.put_typed(keys::TARGET_LOCATION, &location)?;
        Ok(())
    }
}

/// Copies the source object to the chosen location.
pub struct CopyFileStage {
    object_mover: Arc<dyn ObjectMover>,
    source_path: String,
}

#[async_trait]
impl Stage for CopyFileStage {
    fn name(&self) -> &str {
        "copy_file"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let location: ObjectLocation = ctx.working_map().get_typed(keys::TARGET_LOCATION)?;
        let info = self.object_mover.copy(&self.source_path, &location).await?;
        info!(
            source = %self.source_path,
            target = %location,
            size = info.size,
            "File copied"
        );
        ctx.working_map_mut().put_typed(keys::FILE_INFO, &info)?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut StageContext) -> StageResult {
        if !ctx.working_map().contains_key(keys::TARGET_LOCATION) {
            return Ok(());
        }
        let location: ObjectLocation = ctx.working_map().get_typed(keys::TARGET_LOCATION)?;
        if self.object_mover.delete(&location).await? {
            info!(target = %location, "Copied file deleted");
        }
        Ok(())
    }
}

/// Records the file in the catalog under the requested path.
pub struct RecordFileStage {
    catalog: Arc<dyn Catalog>,
    request: Arc<FileLoadRequest>,
}

#[async_trait]
impl Stage for RecordFileStage {
    fn name(&self) -> &str {
        "record_file"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let dataset_id = self.request.dataset_id;
        let path = &self.request.target_path;

        match self.catalog.lookup_file(dataset_id, path).await? {
            Some(existing) if existing.created_by == ctx.instance_id() => {
                debug!(file_id = %existing.file_id, "File record already written by this instance");
                return Ok(());
            }
            Some(_) => {
                return Err(CapabilityError::Conflict(format!(
                    "path '{}' already exists in dataset {}",
                    path, dataset_id
                ))
                .into());
            }
            None => {}
        }

        let working = ctx.working_map();
        let info: FileInfo = working.get_typed(keys::FILE_INFO)?;
        let record = FileRecord {
            file_id: working.get_uuid(keys::FILE_ID)?,
            dataset_id,
            path: path.clone(),
            location: working.get_typed(keys::TARGET_LOCATION)?,
            size: info.size,
            checksum: info.checksum,
            description: self.request.description.clone(),
            mime_type: self.request.mime_type.clone(),
            created_by: ctx.instance_id().to_string(),
        };
        self.catalog.create_file(&record).await?;
        info!(file_id = %record.file_id, path = %record.path, "File record created");
        Ok(())
    }

    async fn compensate(&self, ctx: &mut StageContext) -> StageResult {
        let dataset_id = self.request.dataset_id;
        let path = &self.request.target_path;

        match self.catalog.lookup_file(dataset_id, path).await? {
            Some(existing) if existing.created_by == ctx.instance_id() => {
                self.catalog.delete_file(dataset_id, path).await?;
                info!(file_id = %existing.file_id, "File record deleted");
            }
            _ => debug!(path = %path, "No file record owned by this instance"),
        }
        Ok(())
    }
}

/// Stores the file record as the response.
pub struct FileResponseStage {
    catalog: Arc<dyn Catalog>,
    request: Arc<FileLoadRequest>,
}

#[async_trait]
impl Stage for FileResponseStage {
    fn name(&self) -> &str {
        "file_response"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let record = self
            .catalog
            .lookup_file(self.request.dataset_id, &self.request.target_path)
            .await?
            .ok_or_else(|| CapabilityError::not_found("file", &self.request.target_path))?;
        respond(ctx, &record)
    }
}
