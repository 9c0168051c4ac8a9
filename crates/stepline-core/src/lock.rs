// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource lock stages.
//!
//! Instances that must not touch the same named resource at once bracket
//! the critical stages with [`AcquireLockStage`] and [`ReleaseLockStage`].
//! Ownership lives in the persistence store's lock table, keyed by resource
//! name and owned by instance id, so it survives restarts.
//!
//! Give the acquire stage a retry policy: contention is reported as a
//! retryable failure with code [`RESOURCE_LOCKED`](crate::stage::codes::RESOURCE_LOCKED),
//! and the policy decides how long to wait for the holder.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::StageContext;
use crate::persistence::Persistence;
use crate::stage::{Stage, StageError, StageResult, codes};

fn store_error(action: &str, key: &str, err: impl std::fmt::Display) -> StageError {
    StageError::retryable(format!("failed to {} lock '{}': {}", action, key, err))
}

/// Takes ownership of a named resource for the running instance.
pub struct AcquireLockStage {
    persistence: Arc<dyn Persistence>,
    key: String,
}

impl AcquireLockStage {
    /// Create a stage locking `key`.
    pub fn new(persistence: Arc<dyn Persistence>, key: impl Into<String>) -> Self {
        Self {
            persistence,
            key: key.into(),
        }
    }

    /// The resource key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Stage for AcquireLockStage {
    fn name(&self) -> &str {
        "acquire_lock"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let acquired = self
            .persistence
            .try_acquire_lock(&self.key, ctx.instance_id())
            .await
            .map_err(|e| store_error("acquire", &self.key, e))?;

        if acquired {
            debug!(instance_id = %ctx.instance_id(), key = %self.key, "Lock acquired");
            return Ok(());
        }

        let owner = match self.persistence.lock_owner(&self.key).await {
            Ok(owner) => owner,
            Err(e) => {
                debug!(key = %self.key, error = %e, "Could not read lock owner");
                None
            }
        };
        debug!(
            instance_id = %ctx.instance_id(),
            key = %self.key,
            owner = ?owner,
            attempt = ctx.attempt(),
            "Lock held by another instance"
        );
        Err(StageError::retryable(format!(
            "resource '{}' is locked by {}",
            self.key,
            owner.as_deref().unwrap_or("another instance")
        ))
        .with_code(codes::RESOURCE_LOCKED))
    }

    async fn compensate(&self, ctx: &mut StageContext) -> StageResult {
        // A no-op unless this instance is the holder.
        let released = self
            .persistence
            .release_lock(&self.key, ctx.instance_id())
            .await
            .map_err(|e| store_error("release", &self.key, e))?;
        if released {
            debug!(instance_id = %ctx.instance_id(), key = %self.key, "Lock released on undo");
        }
        Ok(())
    }
}

/// Gives up ownership of a named resource.
///
/// Running it when the lock is not held (e.g. on recovery after the release
/// already happened) is not an error.
pub struct ReleaseLockStage {
    persistence: Arc<dyn Persistence>,
    key: String,
}

impl ReleaseLockStage {
    /// Create a stage releasing `key`.
    pub fn new(persistence: Arc<dyn Persistence>, key: impl Into<String>) -> Self {
        Self {
            persistence,
            key: key.into(),
        }
    }
}

#[async_trait]
impl Stage for ReleaseLockStage {
    fn name(&self) -> &str {
        "release_lock"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let released = self
            .persistence
            .release_lock(&self.key, ctx.instance_id())
            .await
            .map_err(|e| store_error("release", &self.key, e))?;
        if !released {
            warn!(
                instance_id = %ctx.instance_id(),
                key = %self.key,
                "Lock was not held at release"
            );
        }
        Ok(())
    }
}
