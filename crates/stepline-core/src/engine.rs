// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow engine.
//!
//! [`Engine`] accepts submissions, persists them, and drives each instance
//! through its stages on a bounded pool of tokio tasks. One task owns an
//! instance from the moment it gets a worker permit until the instance is
//! terminal, so the working map is never touched concurrently.
//!
//! # Example
//!
//! ```rust,ignore
//! let persistence = stepline_core::persistence::connect(&config).await?;
//! let engine = Engine::builder()
//!     .persistence(persistence)
//!     .registry(registry)
//!     .max_workers(16)
//!     .build()?;
//!
//! engine.recover().await?;
//! let id = engine.submit("dataset.create", params).await?;
//! let state = engine.wait_for_instance(&id).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_MAX_WORKERS, DEFAULT_WAIT_POLL_INTERVAL};
use crate::context::{Direction, StageContext};
use crate::definition::{StageEntry, WorkflowDefinition, WorkflowRegistry};
use crate::error::{EngineError, Result};
use crate::persistence::{self, InstanceError, InstanceRecord, InstanceStatus, Persistence};
use crate::retry::RetryDecision;
use crate::stage::{StageError, codes};
use crate::value::ParamMap;

/// Externally visible state of an instance.
#[derive(Debug, Clone)]
pub struct InstanceState {
    /// Instance id.
    pub instance_id: String,
    /// Workflow type it was submitted as.
    pub workflow_type: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Next stage to run or compensate.
    pub stage_index: i32,
    /// Current direction.
    pub direction: Direction,
    /// Final working map, for `success`.
    pub result_map: Option<ParamMap>,
    /// Captured failure, for `error` and `fatal`.
    pub error: Option<InstanceError>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time the instance became terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<InstanceRecord> for InstanceState {
    fn from(record: InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id,
            workflow_type: record.workflow_type,
            status: record.status,
            stage_index: record.stage_index,
            direction: record.direction,
            result_map: record.result_map,
            error: record.error,
            created_at: record.created_at,
            completed_at: record.completed_at,
        }
    }
}

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: Option<WorkflowRegistry>,
    max_workers: usize,
    wait_poll_interval: Duration,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("max_workers", &self.max_workers)
            .field("wait_poll_interval", &self.wait_poll_interval)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            registry: None,
            max_workers: DEFAULT_MAX_WORKERS,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        }
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the workflow registry (required).
    pub fn registry(mut self, registry: WorkflowRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Maximum instances executing at once.
    ///
    /// Default: 8
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// How often waiters re-read the store between notifications.
    ///
    /// Default: 500ms
    pub fn wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<Engine> {
        let persistence = self.persistence.ok_or_else(|| EngineError::Configuration {
            reason: "persistence is required".to_string(),
        })?;
        let registry = self.registry.ok_or_else(|| EngineError::Configuration {
            reason: "registry is required".to_string(),
        })?;
        if self.max_workers == 0 {
            return Err(EngineError::Configuration {
                reason: "max_workers must be greater than zero".to_string(),
            });
        }

        Ok(Engine {
            shared: Arc::new(Shared {
                persistence,
                registry,
                workers: Arc::new(Semaphore::new(self.max_workers)),
                max_workers: self.max_workers,
                wait_poll_interval: self.wait_poll_interval,
                active: Mutex::new(HashMap::new()),
                finished: Notify::new(),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }
}

/// Durable saga engine.
///
/// Cheap to clone; clones share the same worker pool.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.shared.registry)
            .field("max_workers", &self.shared.max_workers)
            .field("active", &self.active_count())
            .finish()
    }
}

struct Shared {
    persistence: Arc<dyn Persistence>,
    registry: WorkflowRegistry,
    workers: Arc<Semaphore>,
    max_workers: usize,
    wait_poll_interval: Duration,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
    finished: Notify,
    shutting_down: AtomicBool,
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Connect to the configured database and build an engine around it.
    pub async fn from_config(config: &Config, registry: WorkflowRegistry) -> Result<Self> {
        let persistence = persistence::connect(config).await?;
        Self::builder()
            .persistence(persistence)
            .registry(registry)
            .max_workers(config.max_workers)
            .wait_poll_interval(config.wait_poll_interval)
            .build()
    }

    /// The persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.shared.persistence
    }

    /// The workflow registry.
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.shared.registry
    }

    /// Submit a new instance of `workflow_type`.
    ///
    /// The definition is built first; if that fails no instance is created.
    /// On success the instance is persisted as `queued` and handed to the
    /// worker pool, and its id is returned immediately.
    #[instrument(skip(self, params), fields(workflow_type = %workflow_type))]
    pub async fn submit(&self, workflow_type: &str, params: ParamMap) -> Result<String> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let definition = self.shared.registry.build(workflow_type, &params)?;

        let instance_id = Uuid::new_v4().to_string();
        let record = InstanceRecord::new_queued(&instance_id, workflow_type, params);
        self.shared.persistence.create_instance(&record).await?;

        info!(
            instance_id = %instance_id,
            stages = definition.len(),
            "Workflow instance submitted"
        );

        self.spawn(record, definition);
        Ok(instance_id)
    }

    /// Submit with parameters given as JSON.
    ///
    /// `params` must be an object in the stored map format; anything else is
    /// a [`EngineError::WorkflowMap`].
    pub async fn submit_json(
        &self,
        workflow_type: &str,
        params: serde_json::Value,
    ) -> Result<String> {
        if params.is_null() {
            return Err(EngineError::WorkflowMap {
                reason: "parameter map is null".to_string(),
            });
        }
        if !params.is_object() {
            return Err(EngineError::WorkflowMap {
                reason: "parameter map must be a JSON object".to_string(),
            });
        }
        let params: ParamMap =
            serde_json::from_value(params).map_err(|e| EngineError::WorkflowMap {
                reason: e.to_string(),
            })?;
        self.submit(workflow_type, params).await
    }

    /// Current state of an instance.
    pub async fn get_instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        self.shared
            .persistence
            .get_instance(instance_id)
            .await?
            .map(InstanceState::from)
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    /// List instances, newest first.
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceState>> {
        let records = self
            .shared
            .persistence
            .list_instances(status, limit, offset)
            .await?;
        Ok(records.into_iter().map(InstanceState::from).collect())
    }

    /// Wait until the instance is terminal and return its final state.
    ///
    /// Wakes on every terminal transition in this engine, and re-reads the
    /// store at least once per poll interval so instances finished by
    /// another process are noticed too.
    pub async fn wait_for_instance(&self, instance_id: &str) -> Result<InstanceState> {
        loop {
            let notified = self.shared.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.get_instance_state(instance_id).await?;
            if state.status.is_terminal() {
                return Ok(state);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.shared.wait_poll_interval) => {}
            }
        }
    }

    /// As [`wait_for_instance`](Self::wait_for_instance), giving up after `timeout`.
    pub async fn wait_for_instance_timeout(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceState> {
        tokio::time::timeout(timeout, self.wait_for_instance(instance_id))
            .await
            .map_err(|_| EngineError::WaitTimeout {
                instance_id: instance_id.to_string(),
            })?
    }

    /// Resume every `queued` or `running` instance found in the store.
    ///
    /// Call once at startup. Instances resume at their persisted stage index
    /// and direction. Ids already owned by a worker in this engine are
    /// skipped. An instance whose type can no longer be built is marked
    /// `fatal`. Returns the number of instances handed to the pool.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let records = self.shared.persistence.load_incomplete().await?;
        let mut resumed = 0;

        for record in records {
            if self.shared.is_active(&record.instance_id) {
                debug!(instance_id = %record.instance_id, "Instance already owned by a worker");
                continue;
            }

            match self
                .shared
                .registry
                .build(&record.workflow_type, &record.input_parameters)
            {
                Ok(definition) => {
                    info!(
                        instance_id = %record.instance_id,
                        workflow_type = %record.workflow_type,
                        stage_index = record.stage_index,
                        direction = record.direction.as_str(),
                        "Resuming workflow instance"
                    );
                    self.spawn(record, definition);
                    resumed += 1;
                }
                Err(e) => {
                    error!(
                        instance_id = %record.instance_id,
                        workflow_type = %record.workflow_type,
                        error = %e,
                        "Cannot rebuild workflow, marking instance fatal"
                    );
                    let failure = InstanceError {
                        code: codes::INVALID_WORKFLOW.to_string(),
                        message: e.to_string(),
                        stage_index: None,
                    };
                    self.shared
                        .persistence
                        .update_status(
                            &record.instance_id,
                            InstanceStatus::Fatal,
                            Some(&failure),
                            None,
                        )
                        .await?;
                    self.shared.finished.notify_waiters();
                }
            }
        }

        info!(resumed, "Recovery complete");
        Ok(resumed)
    }

    /// Number of instances owned by live workers, including those waiting
    /// for a permit.
    pub fn active_count(&self) -> usize {
        self.shared.active().len()
    }

    /// Stop all workers.
    ///
    /// Running instances are aborted at their next suspension point and
    /// keep whatever state was last persisted, as if the process had
    /// stopped; a later [`recover`](Self::recover) resumes them. New
    /// submissions are rejected with [`EngineError::ShuttingDown`].
    pub async fn shutdown(&self) {
        info!("Engine shutting down...");
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.workers.close();

        let handles: Vec<(String, JoinHandle<()>)> = self.shared.active().drain().collect();
        for (_, handle) in &handles {
            handle.abort();
        }
        for (instance_id, handle) in handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                error!(instance_id = %instance_id, error = %e, "Worker task panicked");
            }
        }

        self.shared.finished.notify_waiters();
        info!("Engine shutdown complete");
    }

    fn spawn(&self, record: InstanceRecord, definition: WorkflowDefinition) {
        let mut active = self.shared.active();
        if active.contains_key(&record.instance_id) {
            return;
        }

        let instance_id = record.instance_id.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let instance_id = record.instance_id.clone();

            // Held until the instance is terminal, retry waits included.
            if let Ok(_permit) = shared.workers.clone().acquire_owned().await {
                if let Err(e) = shared.execute(record, definition).await {
                    error!(
                        instance_id = %instance_id,
                        error = %e,
                        "Workflow execution interrupted; instance will resume on recovery"
                    );
                }
            }

            shared.active().remove(&instance_id);
            shared.finished.notify_waiters();
        });
        active.insert(instance_id, handle);
    }
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_active(&self, instance_id: &str) -> bool {
        self.active().contains_key(instance_id)
    }

    /// Drive one instance to a terminal status.
    ///
    /// Returns `Err` only for persistence failures; stage failures become
    /// state transitions.
    #[instrument(
        skip_all,
        fields(instance_id = %record.instance_id, workflow_type = %record.workflow_type)
    )]
    async fn execute(&self, record: InstanceRecord, definition: WorkflowDefinition) -> Result<()> {
        let instance_id = record.instance_id.clone();
        let stages = definition.stages();

        if record.status != InstanceStatus::Running {
            self.persistence
                .update_status(&instance_id, InstanceStatus::Running, None, None)
                .await?;
        }

        let mut ctx = StageContext::new(
            &instance_id,
            &record.workflow_type,
            Arc::new(record.input_parameters),
            record.working_map,
        );
        let mut failure = record.error;
        let mut next_undo = record.stage_index;

        if record.direction == Direction::Forward {
            let start = usize::try_from(record.stage_index).unwrap_or(0);
            let mut failed_at = None;

            for (index, entry) in stages.iter().enumerate().skip(start) {
                match self
                    .perform(&mut ctx, entry, index, Direction::Forward)
                    .await?
                {
                    Ok(()) => {
                        debug!(stage = entry.stage.name(), stage_index = index, "Stage succeeded");
                        self.persistence
                            .update_progress(
                                &instance_id,
                                index as i32 + 1,
                                Direction::Forward,
                                ctx.working_map(),
                            )
                            .await?;
                    }
                    Err(err) => {
                        warn!(
                            stage = entry.stage.name(),
                            stage_index = index,
                            code = err.code(),
                            error = %err.message(),
                            "Stage failed, compensating"
                        );
                        failed_at = Some((index, err));
                        break;
                    }
                }
            }

            let Some((index, err)) = failed_at else {
                self.persistence
                    .update_status(
                        &instance_id,
                        InstanceStatus::Success,
                        None,
                        Some(ctx.working_map()),
                    )
                    .await?;
                info!("Workflow instance succeeded");
                return Ok(());
            };

            let captured = InstanceError {
                code: err.code().to_string(),
                message: err.message().to_string(),
                stage_index: Some(index as i32),
            };
            self.persistence
                .begin_undo(&instance_id, index as i32, ctx.working_map(), &captured)
                .await?;
            failure = Some(captured);
            next_undo = index as i32;
        }

        let mut index = next_undo.min(stages.len() as i32 - 1);
        while index >= 0 {
            let entry = &stages[index as usize];
            match self
                .perform(&mut ctx, entry, index as usize, Direction::Undo)
                .await?
            {
                Ok(()) => {
                    debug!(stage = entry.stage.name(), stage_index = index, "Stage compensated");
                    index -= 1;
                    self.persistence
                        .update_progress(&instance_id, index, Direction::Undo, ctx.working_map())
                        .await?;
                }
                Err(err) => {
                    error!(
                        stage = entry.stage.name(),
                        stage_index = index,
                        code = err.code(),
                        error = %err.message(),
                        "Compensation failed; instance requires operator attention"
                    );
                    let fatal = InstanceError {
                        code: codes::COMPENSATION_FAILED.to_string(),
                        message: format!(
                            "compensation of stage '{}' failed: {}",
                            entry.stage.name(),
                            err
                        ),
                        stage_index: Some(index),
                    };
                    self.persistence
                        .update_status(&instance_id, InstanceStatus::Fatal, Some(&fatal), None)
                        .await?;
                    return Ok(());
                }
            }
        }

        let failure = failure.unwrap_or_else(|| InstanceError {
            code: codes::STAGE_FATAL.to_string(),
            message: "forward execution failed".to_string(),
            stage_index: None,
        });
        self.persistence
            .update_status(&instance_id, InstanceStatus::Error, Some(&failure), None)
            .await?;
        info!(code = %failure.code, "Workflow instance compensated");
        Ok(())
    }

    /// Run one action of a stage, retrying under its policy.
    ///
    /// The outer `Result` carries persistence failures; the inner one is the
    /// final outcome of the action, always fatal on `Err`.
    async fn perform(
        &self,
        ctx: &mut StageContext,
        entry: &StageEntry,
        index: usize,
        direction: Direction,
    ) -> Result<std::result::Result<(), StageError>> {
        let mut attempt = 1;
        loop {
            ctx.set_position(index, direction, attempt);
            let outcome = match direction {
                Direction::Forward => entry.stage.run(ctx).await,
                Direction::Undo => entry.stage.compensate(ctx).await,
            };

            let err = match outcome {
                Ok(()) => return Ok(Ok(())),
                Err(err) if !err.is_retryable() => return Ok(Err(err)),
                Err(err) => err,
            };

            match entry.retry.decide(attempt) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        stage = entry.stage.name(),
                        stage_index = index,
                        direction = direction.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying stage"
                    );
                    self.persistence
                        .update_progress(
                            ctx.instance_id(),
                            index as i32,
                            direction,
                            ctx.working_map(),
                        )
                        .await?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    let code = if err.code() == codes::STAGE_RETRYABLE {
                        codes::RETRIES_EXHAUSTED.to_string()
                    } else {
                        err.code().to_string()
                    };
                    debug!(
                        stage = entry.stage.name(),
                        stage_index = index,
                        attempt,
                        "Retry policy exhausted"
                    );
                    return Ok(Err(err.into_fatal().with_code(code)));
                }
            }
        }
    }
}
