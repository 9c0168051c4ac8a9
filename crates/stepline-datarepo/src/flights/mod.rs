// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions for the data repository.
//!
//! Each submodule exposes a `definition` factory plus the stages it is made
//! of. Factories parse the request from the input parameters and fail the
//! submission if it is unusable, so a bad request never creates an instance.

pub mod data_delete;
pub mod dataset_create;
pub mod file_ingest;
pub mod snapshot_authorize;

use serde::Serialize;
use serde::de::DeserializeOwned;
use stepline_core::{BuildError, MapError, ParamMap, StageContext, StageResult};

use crate::keys;

/// Workflow type of [`dataset_create`].
pub const DATASET_CREATE: &str = "dataset.create";
/// Workflow type of [`file_ingest`].
pub const FILE_INGEST: &str = "file.ingest";
/// Workflow type of [`snapshot_authorize`].
pub const SNAPSHOT_AUTHORIZE: &str = "snapshot.authorize";
/// Workflow type of [`data_delete`].
pub const DATA_DELETE: &str = "dataset.data_delete";

/// Input parameters carrying `request`.
pub fn request_params<T: Serialize>(request: &T) -> Result<ParamMap, MapError> {
    let mut params = ParamMap::new();
    params.put_typed(keys::REQUEST, request)?;
    Ok(params)
}

/// Resource lock key serializing ingests that share a load tag.
pub fn load_lock_key(load_tag: &str) -> String {
    format!("load:{}", load_tag)
}

/// Resource lock key serializing data changes to a dataset.
pub fn dataset_lock_key(dataset_id: &uuid::Uuid) -> String {
    format!("dataset:{}", dataset_id)
}

pub(crate) fn parse_request<T: DeserializeOwned>(params: &ParamMap) -> Result<T, BuildError> {
    Ok(params.get_typed(keys::REQUEST)?)
}

pub(crate) fn respond<T: Serialize>(ctx: &mut StageContext, response: &T) -> StageResult {
    ctx.working_map_mut().put_typed(keys::RESPONSE, response)?;
    Ok(())
}
