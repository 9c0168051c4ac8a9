// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `snapshot.authorize`: lock the snapshot in the catalog, create its
//! authorization resource with readers, grant query access, unlock.
//!
//! The snapshot lock is the catalog's own object lock, not a resource lock
//! stage: another holder fails the instance immediately.

use std::sync::Arc;

use async_trait::async_trait;
use stepline_core::{BuildError, ParamMap, Stage, StageContext, StageResult, WorkflowDefinition};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{Authorizer, Capabilities, CapabilityError, Catalog};
use crate::flights::{parse_request, respond};
use crate::model::{ResourceRef, SnapshotAuthorizeRequest, SnapshotAuthorizeResponse, roles};

/// Build a `snapshot.authorize` definition for the request in `params`.
pub fn definition(
    capabilities: &Capabilities,
    params: &ParamMap,
) -> Result<WorkflowDefinition, BuildError> {
    let request: SnapshotAuthorizeRequest = parse_request(params)?;
    let request = Arc::new(request);

    let mut definition = WorkflowDefinition::new();
    definition
        .add_stage(LockSnapshotStage {
            catalog: capabilities.catalog.clone(),
            snapshot_id: request.snapshot_id,
        })
        .add_stage_with_retry(
            AuthorizeSnapshotStage {
                authorizer: capabilities.authorizer.clone(),
                request: request.clone(),
            },
            capabilities.call_retry,
        )
        .add_stage_with_retry(
            GrantQueryAccessStage {
                authorizer: capabilities.authorizer.clone(),
                request: request.clone(),
            },
            capabilities.call_retry,
        )
        .add_stage_with_retry(
            UnlockSnapshotStage {
                catalog: capabilities.catalog.clone(),
                snapshot_id: request.snapshot_id,
            },
            capabilities.call_retry,
        );
    Ok(definition)
}

/// Takes the catalog lock on the snapshot.
pub struct LockSnapshotStage {
    catalog: Arc<dyn Catalog>,
    snapshot_id: Uuid,
}

#[async_trait]
impl Stage for LockSnapshotStage {
    fn name(&self) -> &str {
        "lock_snapshot"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        self.catalog.lock(self.snapshot_id, ctx.instance_id()).await?;
        debug!(snapshot_id = %self.snapshot_id, "Snapshot locked");
        Ok(())
    }

    async fn compensate(&self, ctx: &mut StageContext) -> StageResult {
        if !self
            .catalog
            .unlock(self.snapshot_id, ctx.instance_id())
            .await?
        {
            debug!(snapshot_id = %self.snapshot_id, "Snapshot was not locked by this instance");
        }
        Ok(())
    }
}

/// Creates the snapshot's resource and grants readers.
pub struct AuthorizeSnapshotStage {
    authorizer: Arc<dyn Authorizer>,
    request: Arc<SnapshotAuthorizeRequest>,
}

#[async_trait]
impl Stage for AuthorizeSnapshotStage {
    fn name(&self) -> &str {
        "authorize_snapshot"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let resource = ResourceRef::snapshot(self.request.snapshot_id);
        self.authorizer.create_resource(&resource).await?;
        for reader in &self.request.readers {
            self.authorizer
                .grant_role(&resource, roles::READER, reader)
                .await?;
        }
        info!(
            resource = %resource,
            readers = self.request.readers.len(),
            "Snapshot authorization resource created"
        );

        respond(
            ctx,
            &SnapshotAuthorizeResponse {
                snapshot_id: self.request.snapshot_id,
                readers: self.request.readers.clone(),
            },
        )
    }

    async fn compensate(&self, _ctx: &mut StageContext) -> StageResult {
        let resource = ResourceRef::snapshot(self.request.snapshot_id);
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

/// Lets readers run query jobs against the snapshot. Removed together with
/// the resource, so there is nothing to undo here.
pub struct GrantQueryAccessStage {
    authorizer: Arc<dyn Authorizer>,
    request: Arc<SnapshotAuthorizeRequest>,
}

#[async_trait]
impl Stage for GrantQueryAccessStage {
    fn name(&self) -> &str {
        "grant_query_access"
    }

    async fn run(&self, _ctx: &mut StageContext) -> StageResult {
        let resource = ResourceRef::snapshot(self.request.snapshot_id);
        for reader in &self.request.readers {
            self.authorizer
                .grant_role(&resource, roles::QUERY_USER, reader)
                .await?;
        }
        Ok(())
    }
}

/// Releases the catalog lock on the snapshot.
pub struct UnlockSnapshotStage {
    catalog: Arc<dyn Catalog>,
    snapshot_id: Uuid,
}

#[async_trait]
impl Stage for UnlockSnapshotStage {
    fn name(&self) -> &str {
        "unlock_snapshot"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        if !self
            .catalog
            .unlock(self.snapshot_id, ctx.instance_id())
            .await?
        {
            warn!(snapshot_id = %self.snapshot_id, "Snapshot lock was not held at unlock");
        }
        Ok(())
    }
}
