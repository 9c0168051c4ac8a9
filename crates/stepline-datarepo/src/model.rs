// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Requests, catalog records and responses exchanged by the data-repository
//! workflows.
//!
//! Requests travel in the instance's input parameters as JSON documents, so
//! every type here is serde-serializable.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles granted on authorization resources.
pub mod roles {
    /// Full control over a dataset.
    pub const STEWARD: &str = "steward";
    /// Read access to a dataset or snapshot.
    pub const READER: &str = "reader";
    /// Permission to run query jobs against a snapshot.
    pub const QUERY_USER: &str = "query_user";
}

/// One table of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name, unique within the dataset.
    pub name: String,
    /// Column names.
    #[serde(default)]
    pub columns: Vec<String>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Request to create a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRequest {
    /// Dataset name, unique across the catalog.
    pub name: String,
    /// Free-text description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Billing profile that pays for storage and queries.
    pub profile_id: String,
    /// Tables to create.
    pub tables: Vec<TableSpec>,
    /// Members granted the steward role.
    #[serde(default)]
    pub stewards: Vec<String>,
}

impl DatasetRequest {
    /// Reject requests that no stage could satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if !valid_name(&self.name) {
            return Err(format!(
                "invalid dataset name '{}': use 1-63 letters, digits or underscores",
                self.name
            ));
        }
        if self.profile_id.is_empty() {
            return Err("profile_id must not be empty".to_string());
        }
        if self.tables.is_empty() {
            return Err("a dataset needs at least one table".to_string());
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if !valid_name(&table.name) {
                return Err(format!("invalid table name '{}'", table.name));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(format!("duplicate table name '{}'", table.name));
            }
        }
        Ok(())
    }
}

/// A dataset as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Catalog id.
    pub id: Uuid,
    /// Unique name.
    pub name: String,
    /// Free-text description.
    pub description: Option<String>,
    /// Billing profile.
    pub profile_id: String,
    /// Tables.
    pub tables: Vec<TableSpec>,
    /// Instance id of the workflow that created the record.
    pub created_by: String,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl Dataset {
    /// A new catalog record for `request`, owned by `created_by`.
    pub fn from_request(request: &DatasetRequest, created_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            description: request.description.clone(),
            profile_id: request.profile_id.clone(),
            tables: request.tables.clone(),
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Response of `dataset.create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Catalog id.
    pub id: Uuid,
    /// Name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Billing profile.
    pub profile_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<&Dataset> for DatasetSummary {
    fn from(dataset: &Dataset) -> Self {
        Self {
            id: dataset.id,
            name: dataset.name.clone(),
            description: dataset.description.clone(),
            profile_id: dataset.profile_id.clone(),
            created_at: dataset.created_at,
        }
    }
}

/// Request to ingest one file into a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLoadRequest {
    /// Target dataset.
    pub dataset_id: Uuid,
    /// Where to copy the bytes from.
    pub source_path: String,
    /// Logical path of the file inside the dataset, e.g. `/raw/sample.bam`.
    pub target_path: String,
    /// Tag grouping related loads; at most one ingest per tag runs at a time.
    pub load_tag: String,
    /// Billing profile, which also selects the storage bucket.
    pub profile_id: String,
    /// Free-text description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Content type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Member on whose behalf the file is ingested; must steward the dataset.
    pub requested_by: String,
}

impl FileLoadRequest {
    /// Reject requests that no stage could satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.source_path.is_empty() {
            return Err("source_path must not be empty".to_string());
        }
        if !self.target_path.starts_with('/') || self.target_path.ends_with('/') {
            return Err(format!(
                "target_path '{}' must be absolute and name a file",
                self.target_path
            ));
        }
        if self.load_tag.is_empty() {
            return Err("load_tag must not be empty".to_string());
        }
        if self.profile_id.is_empty() {
            return Err("profile_id must not be empty".to_string());
        }
        if self.requested_by.is_empty() {
            return Err("requested_by must not be empty".to_string());
        }
        Ok(())
    }
}

/// Physical location of an object in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Bucket name.
    pub bucket: String,
    /// Object path within the bucket.
    pub path: String,
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.path)
    }
}

/// What the object mover reports about a copied object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Size in bytes.
    pub size: u64,
    /// Content checksum, hex encoded.
    pub checksum: String,
}

/// A file as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File id.
    pub file_id: Uuid,
    /// Owning dataset.
    pub dataset_id: Uuid,
    /// Logical path inside the dataset.
    pub path: String,
    /// Where the bytes live.
    pub location: ObjectLocation,
    /// Size in bytes.
    pub size: u64,
    /// Content checksum.
    pub checksum: String,
    /// Description.
    pub description: Option<String>,
    /// Content type.
    pub mime_type: Option<String>,
    /// Instance id of the workflow that created the record.
    pub created_by: String,
}

/// Kinds of authorization resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A dataset.
    Dataset,
    /// A snapshot.
    Snapshot,
}

impl ResourceKind {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Dataset => "dataset",
            ResourceKind::Snapshot => "snapshot",
        }
    }
}

/// Identifies an authorization resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Catalog id of the protected object.
    pub id: Uuid,
}

impl ResourceRef {
    /// The resource protecting a dataset.
    pub fn dataset(id: Uuid) -> Self {
        Self {
            kind: ResourceKind::Dataset,
            id,
        }
    }

    /// The resource protecting a snapshot.
    pub fn snapshot(id: Uuid) -> Self {
        Self {
            kind: ResourceKind::Snapshot,
            id,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Request to authorize readers on a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAuthorizeRequest {
    /// The snapshot.
    pub snapshot_id: Uuid,
    /// Members granted the reader role.
    #[serde(default)]
    pub readers: Vec<String>,
}

/// Response of `snapshot.authorize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAuthorizeResponse {
    /// The snapshot.
    pub snapshot_id: Uuid,
    /// Members that now hold the reader role.
    pub readers: Vec<String>,
}

/// One table to soft-delete rows from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTableSpec {
    /// Dataset table name.
    pub table: String,
    /// File listing the row ids to delete.
    pub source_path: String,
}

/// Request to soft-delete rows from dataset tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDeleteRequest {
    /// Target dataset.
    pub dataset_id: Uuid,
    /// Tables and their row-id files.
    pub tables: Vec<DeleteTableSpec>,
}

impl DataDeleteRequest {
    /// Reject requests that no stage could satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.tables.is_empty() {
            return Err("no tables to delete from".to_string());
        }
        let mut seen = HashSet::new();
        for spec in &self.tables {
            if spec.source_path.is_empty() {
                return Err(format!("table '{}' has no source_path", spec.table));
            }
            if !seen.insert(spec.table.as_str()) {
                return Err(format!("table '{}' listed twice", spec.table));
            }
        }
        Ok(())
    }
}

/// Response of `dataset.data_delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDeleteResponse {
    /// The dataset.
    pub dataset_id: Uuid,
    /// Rows marked deleted across all tables.
    pub rows_deleted: u64,
}
