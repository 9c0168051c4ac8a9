// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stepline-core integration tests.
//!
//! Provides scripted stages that record every action into a shared trace,
//! and helpers for building engines over in-memory or file-backed SQLite.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Notify;

use stepline_core::persistence::{PostgresPersistence, SqlitePersistence};
use stepline_core::{
    Engine, ParamValue, Persistence, RetryPolicy, Stage, StageContext, StageError, StageResult,
    WorkflowDefinition, WorkflowRegistry,
};

/// Upper bound for any single wait in these tests.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Skip the current test unless a PostgreSQL URL is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub async fn memory_persistence() -> Arc<dyn Persistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    stepline_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqlitePersistence::new(pool))
}

pub async fn file_persistence(path: &Path) -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::from_path(path)
            .await
            .expect("Failed to open SQLite file"),
    )
}

pub async fn postgres_persistence() -> Option<Arc<dyn Persistence>> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let persistence = PostgresPersistence::connect(&url, 5).await.ok()?;
    Some(Arc::new(persistence))
}

pub fn engine(persistence: Arc<dyn Persistence>, registry: WorkflowRegistry) -> Engine {
    engine_with_workers(persistence, registry, 4)
}

pub fn engine_with_workers(
    persistence: Arc<dyn Persistence>,
    registry: WorkflowRegistry,
    max_workers: usize,
) -> Engine {
    Engine::builder()
        .persistence(persistence)
        .registry(registry)
        .max_workers(max_workers)
        .wait_poll_interval(Duration::from_millis(20))
        .build()
        .expect("Failed to build engine")
}

/// Ordered record of stage actions, e.g. `"B.compensate"`.
pub type Trace = Arc<Mutex<Vec<String>>>;

pub fn new_trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(trace: &Trace) -> Vec<String> {
    trace.lock().unwrap().clone()
}

/// What a scripted action does each time it is invoked.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fatal,
    /// Fail retryably on every attempt.
    Retryable,
    /// Fail retryably on the first `n` attempts, then succeed.
    RetryableTimes(u32),
    /// Signal `entered` and never return.
    Block,
}

pub struct ScriptedStage {
    name: String,
    trace: Trace,
    run: Behavior,
    compensate: Behavior,
    output: Option<(String, ParamValue)>,
    run_calls: AtomicU32,
    compensate_calls: AtomicU32,
    entered: Arc<Notify>,
}

impl ScriptedStage {
    pub fn new(name: &str, trace: &Trace) -> Self {
        Self {
            name: name.to_string(),
            trace: trace.clone(),
            run: Behavior::Succeed,
            compensate: Behavior::Succeed,
            output: None,
            run_calls: AtomicU32::new(0),
            compensate_calls: AtomicU32::new(0),
            entered: Arc::new(Notify::new()),
        }
    }

    pub fn on_run(mut self, behavior: Behavior) -> Self {
        self.run = behavior;
        self
    }

    pub fn on_compensate(mut self, behavior: Behavior) -> Self {
        self.compensate = behavior;
        self
    }

    /// Write `key = value` into the working map after a successful run.
    pub fn writes(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.output = Some((key.to_string(), value.into()));
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn run_calls(&self) -> u32 {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn compensate_calls(&self) -> u32 {
        self.compensate_calls.load(Ordering::SeqCst)
    }

    /// Notified when a `Block` action starts.
    pub fn entered(&self) -> Arc<Notify> {
        self.entered.clone()
    }

    async fn act(&self, action: &str, behavior: Behavior, calls: &AtomicU32) -> StageResult {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.trace
            .lock()
            .unwrap()
            .push(format!("{}.{}", self.name, action));

        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fatal => Err(StageError::fatal(format!(
                "{} {} failed",
                self.name, action
            ))),
            Behavior::Retryable => Err(StageError::retryable(format!(
                "{} {} not ready",
                self.name, action
            ))),
            Behavior::RetryableTimes(limit) if n <= limit => Err(StageError::retryable(
                format!("{} {} not ready (attempt {})", self.name, action, n),
            )),
            Behavior::RetryableTimes(_) => Ok(()),
            Behavior::Block => {
                self.entered.notify_one();
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        self.act("run", self.run, &self.run_calls).await?;
        if let Some((key, value)) = &self.output {
            ctx.working_map_mut().put(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn compensate(&self, _ctx: &mut StageContext) -> StageResult {
        self.act("compensate", self.compensate, &self.compensate_calls)
            .await
    }
}

/// Register `workflow_type` as the given stages in order.
pub fn register(
    registry: &mut WorkflowRegistry,
    workflow_type: &str,
    stages: Vec<(Arc<dyn Stage>, RetryPolicy)>,
) {
    registry.register(workflow_type, move |_params| {
        let mut definition = WorkflowDefinition::new();
        for (stage, retry) in &stages {
            definition.add_shared_stage(stage.clone(), *retry);
        }
        Ok(definition)
    });
}

/// One stage with its retry policy.
pub fn step(stage: &Arc<ScriptedStage>, retry: RetryPolicy) -> (Arc<dyn Stage>, RetryPolicy) {
    (stage.clone(), retry)
}

/// Stages with no retries.
pub fn plain(stages: &[&Arc<ScriptedStage>]) -> Vec<(Arc<dyn Stage>, RetryPolicy)> {
    stages
        .iter()
        .map(|s| ((*s).clone() as Arc<dyn Stage>, RetryPolicy::None))
        .collect()
}
