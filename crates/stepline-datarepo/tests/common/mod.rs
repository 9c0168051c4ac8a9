// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stepline-datarepo integration tests.
//!
//! In-memory implementations of every capability, each able to fail chosen
//! operations on demand, plus an engine wired to them over in-memory SQLite.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use stepline_core::persistence::SqlitePersistence;
use stepline_core::{Engine, Persistence, RetryPolicy, WorkflowRegistry};
use stepline_datarepo::model::{
    Dataset, DatasetRequest, FileInfo, FileRecord, ObjectLocation, ResourceRef, TableSpec, roles,
};
use stepline_datarepo::{
    Authorizer, Capabilities, CapabilityError, CapabilityResult, Catalog, ObjectMover,
    QueryEngine,
};

/// Member granted the steward role on every seeded dataset.
pub const STEWARD: &str = "steward@example.org";

/// Upper bound for any single wait in these tests.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Queued failures per operation name.
#[derive(Default)]
pub struct Faults {
    queued: Mutex<HashMap<&'static str, VecDeque<CapabilityError>>>,
}

impl Faults {
    /// Fail the next `times` calls of `op` with `err`.
    pub fn inject(&self, op: &'static str, err: CapabilityError, times: usize) {
        let mut queued = self.queued.lock().unwrap();
        let queue = queued.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    fn check(&self, op: &'static str) -> CapabilityResult<()> {
        match self
            .queued
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(|q| q.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct CatalogState {
    datasets: HashMap<Uuid, Dataset>,
    files: HashMap<(Uuid, String), FileRecord>,
    locks: HashMap<Uuid, String>,
}

#[derive(Default)]
pub struct FakeCatalog {
    state: Mutex<CatalogState>,
    pub faults: Faults,
}

impl FakeCatalog {
    pub fn insert_dataset(&self, dataset: Dataset) {
        self.state
            .lock()
            .unwrap()
            .datasets
            .insert(dataset.id, dataset);
    }

    pub fn dataset_named(&self, name: &str) -> Option<Dataset> {
        self.state
            .lock()
            .unwrap()
            .datasets
            .values()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn file(&self, dataset_id: Uuid, path: &str) -> Option<FileRecord> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(dataset_id, path.to_string()))
            .cloned()
    }

    pub fn insert_file(&self, record: FileRecord) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert((record.dataset_id, record.path.clone()), record);
    }

    pub fn lock_holder(&self, object_id: Uuid) -> Option<String> {
        self.state.lock().unwrap().locks.get(&object_id).cloned()
    }

    pub fn force_lock(&self, object_id: Uuid, holder: &str) {
        self.state
            .lock()
            .unwrap()
            .locks
            .insert(object_id, holder.to_string());
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn create_dataset(&self, dataset: &Dataset) -> CapabilityResult<()> {
        self.faults.check("catalog.create_dataset")?;
        let mut state = self.state.lock().unwrap();
        if state.datasets.values().any(|d| d.name == dataset.name) {
            return Err(CapabilityError::Conflict(format!(
                "dataset '{}' exists",
                dataset.name
            )));
        }
        state.datasets.insert(dataset.id, dataset.clone());
        Ok(())
    }

    async fn retrieve(&self, id: Uuid) -> CapabilityResult<Dataset> {
        self.faults.check("catalog.retrieve")?;
        self.state
            .lock()
            .unwrap()
            .datasets
            .get(&id)
            .cloned()
            .ok_or_else(|| CapabilityError::not_found("dataset", id))
    }

    async fn retrieve_by_name(&self, name: &str) -> CapabilityResult<Option<Dataset>> {
        self.faults.check("catalog.retrieve_by_name")?;
        Ok(self.dataset_named(name))
    }

    async fn delete_dataset(&self, id: Uuid) -> CapabilityResult<bool> {
        self.faults.check("catalog.delete_dataset")?;
        Ok(self.state.lock().unwrap().datasets.remove(&id).is_some())
    }

    async fn lock(&self, object_id: Uuid, flight_id: &str) -> CapabilityResult<()> {
        self.faults.check("catalog.lock")?;
        let mut state = self.state.lock().unwrap();
        if let Some(holder) = state.locks.get(&object_id)
            && holder != flight_id
        {
            return Err(CapabilityError::Locked {
                resource: format!("object {}", object_id),
                holder: holder.clone(),
            });
        }
        state.locks.insert(object_id, flight_id.to_string());
        Ok(())
    }

    async fn unlock(&self, object_id: Uuid, flight_id: &str) -> CapabilityResult<bool> {
        self.faults.check("catalog.unlock")?;
        let mut state = self.state.lock().unwrap();
        if state.locks.get(&object_id).map(String::as_str) == Some(flight_id) {
            state.locks.remove(&object_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn create_file(&self, record: &FileRecord) -> CapabilityResult<()> {
        self.faults.check("catalog.create_file")?;
        let mut state = self.state.lock().unwrap();
        let key = (record.dataset_id, record.path.clone());
        if state.files.contains_key(&key) {
            return Err(CapabilityError::Conflict(format!(
                "file '{}' exists",
                record.path
            )));
        }
        state.files.insert(key, record.clone());
        Ok(())
    }

    async fn lookup_file(
        &self,
        dataset_id: Uuid,
        path: &str,
    ) -> CapabilityResult<Option<FileRecord>> {
        self.faults.check("catalog.lookup_file")?;
        Ok(self.file(dataset_id, path))
    }

    async fn delete_file(&self, dataset_id: Uuid, path: &str) -> CapabilityResult<bool> {
        self.faults.check("catalog.delete_file")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .files
            .remove(&(dataset_id, path.to_string()))
            .is_some())
    }
}

#[derive(Default)]
struct QueryState {
    datasets: HashSet<String>,
    tables: HashSet<String>,
    soft_deleted: Vec<(String, String)>,
}

pub struct FakeQueryEngine {
    state: Mutex<QueryState>,
    rows_per_table: u64,
    pub faults: Faults,
}

impl Default for FakeQueryEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueryState::default()),
            rows_per_table: 3,
            faults: Faults::default(),
        }
    }
}

impl FakeQueryEngine {
    pub fn has_dataset(&self, name: &str) -> bool {
        self.state.lock().unwrap().datasets.contains(name)
    }

    pub fn tables(&self) -> HashSet<String> {
        self.state.lock().unwrap().tables.clone()
    }

    /// `(table, external_table)` pairs soft deletes were applied from.
    pub fn soft_deleted(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().soft_deleted.clone()
    }
}

#[async_trait]
impl QueryEngine for FakeQueryEngine {
    async fn create_dataset(&self, dataset: &Dataset) -> CapabilityResult<()> {
        self.faults.check("query.create_dataset")?;
        if !self
            .state
            .lock()
            .unwrap()
            .datasets
            .insert(dataset.name.clone())
        {
            return Err(CapabilityError::Conflict(format!(
                "dataset '{}' exists",
                dataset.name
            )));
        }
        Ok(())
    }

    async fn drop_dataset(&self, dataset: &Dataset) -> CapabilityResult<bool> {
        self.faults.check("query.drop_dataset")?;
        Ok(self.state.lock().unwrap().datasets.remove(&dataset.name))
    }

    async fn create_external_table(
        &self,
        _dataset: &Dataset,
        table_name: &str,
        _source_path: &str,
    ) -> CapabilityResult<()> {
        self.faults.check("query.create_external_table")?;
        if !self
            .state
            .lock()
            .unwrap()
            .tables
            .insert(table_name.to_string())
        {
            return Err(CapabilityError::Conflict(format!(
                "table '{}' exists",
                table_name
            )));
        }
        Ok(())
    }

    async fn apply_soft_deletes(
        &self,
        _dataset: &Dataset,
        table: &str,
        external_table: &str,
    ) -> CapabilityResult<u64> {
        self.faults.check("query.apply_soft_deletes")?;
        let mut state = self.state.lock().unwrap();
        if !state.tables.contains(external_table) {
            return Err(CapabilityError::not_found("table", external_table));
        }
        state
            .soft_deleted
            .push((table.to_string(), external_table.to_string()));
        Ok(self.rows_per_table)
    }

    async fn drop_table(&self, _dataset: &Dataset, table_name: &str) -> CapabilityResult<bool> {
        self.faults.check("query.drop_table")?;
        Ok(self.state.lock().unwrap().tables.remove(table_name))
    }
}

#[derive(Default)]
pub struct FakeObjectMover {
    sources: Mutex<HashMap<String, Vec<u8>>>,
    objects: Mutex<HashMap<ObjectLocation, FileInfo>>,
    pub faults: Faults,
}

impl FakeObjectMover {
    pub fn add_source(&self, path: &str, bytes: &[u8]) {
        self.sources
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn object(&self, location: &ObjectLocation) -> Option<FileInfo> {
        self.objects.lock().unwrap().get(location).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

fn checksum(bytes: &[u8]) -> String {
    let sum = bytes
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(*b)));
    format!("{:08x}", sum)
}

#[async_trait]
impl ObjectMover for FakeObjectMover {
    async fn copy(&self, source: &str, target: &ObjectLocation) -> CapabilityResult<FileInfo> {
        self.faults.check("mover.copy")?;
        let bytes = self
            .sources
            .lock()
            .unwrap()
            .get(source)
            .cloned()
            .ok_or_else(|| CapabilityError::not_found("object", source))?;
        let info = FileInfo {
            size: bytes.len() as u64,
            checksum: checksum(&bytes),
        };
        self.objects
            .lock()
            .unwrap()
            .insert(target.clone(), info.clone());
        Ok(info)
    }

    async fn delete(&self, target: &ObjectLocation) -> CapabilityResult<bool> {
        self.faults.check("mover.delete")?;
        Ok(self.objects.lock().unwrap().remove(target).is_some())
    }
}

#[derive(Default)]
pub struct FakeAuthorizer {
    resources: Mutex<HashSet<ResourceRef>>,
    grants: Mutex<HashSet<(ResourceRef, String, String)>>,
    pub faults: Faults,
}

impl FakeAuthorizer {
    pub fn has_resource(&self, resource: &ResourceRef) -> bool {
        self.resources.lock().unwrap().contains(resource)
    }

    pub fn has_grant(&self, resource: &ResourceRef, role: &str, member: &str) -> bool {
        self.grants.lock().unwrap().contains(&(
            *resource,
            role.to_string(),
            member.to_string(),
        ))
    }

    pub fn grant_count(&self) -> usize {
        self.grants.lock().unwrap().len()
    }

    /// Create `resource` if needed and grant `role` on it, bypassing faults.
    pub fn seed_grant(&self, resource: ResourceRef, role: &str, member: &str) {
        self.resources.lock().unwrap().insert(resource);
        self.grants
            .lock()
            .unwrap()
            .insert((resource, role.to_string(), member.to_string()));
    }
}

#[async_trait]
impl Authorizer for FakeAuthorizer {
    async fn create_resource(&self, resource: &ResourceRef) -> CapabilityResult<()> {
        self.faults.check("authz.create_resource")?;
        self.resources.lock().unwrap().insert(*resource);
        Ok(())
    }

    async fn delete_resource(&self, resource: &ResourceRef) -> CapabilityResult<()> {
        self.faults.check("authz.delete_resource")?;
        if !self.resources.lock().unwrap().remove(resource) {
            return Err(CapabilityError::not_found("resource", resource));
        }
        self.grants
            .lock()
            .unwrap()
            .retain(|(granted_on, _, _)| granted_on != resource);
        Ok(())
    }

    async fn grant_role(
        &self,
        resource: &ResourceRef,
        role: &str,
        member: &str,
    ) -> CapabilityResult<()> {
        self.faults.check("authz.grant_role")?;
        if !self.resources.lock().unwrap().contains(resource) {
            return Err(CapabilityError::not_found("resource", resource));
        }
        self.grants
            .lock()
            .unwrap()
            .insert((*resource, role.to_string(), member.to_string()));
        Ok(())
    }

    async fn has_role(
        &self,
        resource: &ResourceRef,
        role: &str,
        member: &str,
    ) -> CapabilityResult<bool> {
        self.faults.check("authz.has_role")?;
        Ok(self.has_grant(resource, role, member))
    }
}

/// Every fake, plus the engine store they share with the lock stages.
pub struct Fakes {
    pub persistence: Arc<dyn Persistence>,
    pub catalog: Arc<FakeCatalog>,
    pub query_engine: Arc<FakeQueryEngine>,
    pub object_mover: Arc<FakeObjectMover>,
    pub authorizer: Arc<FakeAuthorizer>,
}

impl Fakes {
    pub async fn new() -> Self {
        let persistence = SqlitePersistence::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to create in-memory SQLite store");
        Self {
            persistence: Arc::new(persistence),
            catalog: Arc::new(FakeCatalog::default()),
            query_engine: Arc::new(FakeQueryEngine::default()),
            object_mover: Arc::new(FakeObjectMover::default()),
            authorizer: Arc::new(FakeAuthorizer::default()),
        }
    }

    /// Capabilities with millisecond retry policies.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            self.persistence.clone(),
            self.catalog.clone(),
            self.query_engine.clone(),
            self.object_mover.clone(),
            self.authorizer.clone(),
        )
        .with_lock_retry(RetryPolicy::random(Duration::from_millis(5), 400, 5))
        .with_copy_retry(RetryPolicy::exponential(
            Duration::from_millis(1),
            Duration::from_millis(4),
            Duration::from_millis(50),
        ))
        .with_call_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
    }

    pub fn engine(&self) -> Engine {
        let mut registry = WorkflowRegistry::new();
        stepline_datarepo::register_all(&mut registry, self.capabilities());
        Engine::builder()
            .persistence(self.persistence.clone())
            .registry(registry)
            .max_workers(4)
            .wait_poll_interval(Duration::from_millis(20))
            .build()
            .expect("Failed to build engine")
    }

    /// A dataset already present in the catalog.
    pub fn seed_dataset(&self, name: &str, tables: &[&str]) -> Dataset {
        let request = dataset_request(name, tables);
        let dataset = Dataset::from_request(&request, "seed");
        self.catalog.insert_dataset(dataset.clone());
        self.authorizer
            .seed_grant(ResourceRef::dataset(dataset.id), roles::STEWARD, STEWARD);
        dataset
    }
}

pub fn dataset_request(name: &str, tables: &[&str]) -> DatasetRequest {
    DatasetRequest {
        name: name.to_string(),
        description: Some("test dataset".to_string()),
        profile_id: "profile-1".to_string(),
        tables: tables
            .iter()
            .map(|t| TableSpec {
                name: t.to_string(),
                columns: vec!["id".to_string(), "value".to_string()],
            })
            .collect(),
        stewards: vec![STEWARD.to_string()],
    }
}
