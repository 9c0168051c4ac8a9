// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions and the registry that builds them.
//!
//! A definition is the ordered list of stages for one workflow type, each
//! with its own retry policy. Definitions are never persisted: the engine
//! stores the type name and input parameters, and rebuilds the definition
//! from the registry both at submission and during recovery. Factories must
//! therefore be deterministic in the parameters they receive.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;
use crate::stage::Stage;
use crate::value::{MapError, ParamMap};

/// A stage together with the policy governing its retries.
#[derive(Clone)]
pub struct StageEntry {
    /// The stage implementation.
    pub stage: Arc<dyn Stage>,
    /// Retry policy for both `run` and `compensate`.
    pub retry: RetryPolicy,
}

impl fmt::Debug for StageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEntry")
            .field("stage", &self.stage.name())
            .field("retry", &self.retry)
            .finish()
    }
}

/// Ordered list of stages for one workflow type.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDefinition {
    stages: Vec<StageEntry>,
}

impl WorkflowDefinition {
    /// Create an empty definition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage that is not retried.
    pub fn add_stage(&mut self, stage: impl Stage + 'static) -> &mut Self {
        self.add_stage_with_retry(stage, RetryPolicy::None)
    }

    /// Append a stage with a retry policy.
    pub fn add_stage_with_retry(
        &mut self,
        stage: impl Stage + 'static,
        retry: RetryPolicy,
    ) -> &mut Self {
        self.stages.push(StageEntry {
            stage: Arc::new(stage),
            retry,
        });
        self
    }

    /// Append an already shared stage.
    pub fn add_shared_stage(&mut self, stage: Arc<dyn Stage>, retry: RetryPolicy) -> &mut Self {
        self.stages.push(StageEntry { stage, retry });
        self
    }

    /// The stages in execution order.
    pub fn stages(&self) -> &[StageEntry] {
        &self.stages
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the definition has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Why a factory could not build a definition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    /// A parameter was missing or of the wrong kind.
    #[error(transparent)]
    Parameter(#[from] MapError),
    /// Parameters were present but not acceptable.
    #[error("{0}")]
    Invalid(String),
}

type Factory =
    dyn Fn(&ParamMap) -> std::result::Result<WorkflowDefinition, BuildError> + Send + Sync;

/// Maps workflow type names to definition factories.
///
/// Populated once at startup and shared with the engine.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, Arc<Factory>>,
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &names)
            .finish()
    }
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `workflow_type`, replacing any previous one.
    pub fn register<F>(&mut self, workflow_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ParamMap) -> std::result::Result<WorkflowDefinition, BuildError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(workflow_type.into(), Arc::new(factory));
        self
    }

    /// Whether `workflow_type` is registered.
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Registered type names, sorted.
    pub fn workflow_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the definition for `workflow_type` from `params`.
    pub fn build(&self, workflow_type: &str, params: &ParamMap) -> Result<WorkflowDefinition> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| EngineError::InvalidWorkflow {
                workflow_type: workflow_type.to_string(),
                reason: "workflow type is not registered".to_string(),
            })?;

        let definition = factory(params).map_err(|e| EngineError::InvalidWorkflow {
            workflow_type: workflow_type.to_string(),
            reason: e.to_string(),
        })?;

        if definition.is_empty() {
            return Err(EngineError::InvalidWorkflow {
                workflow_type: workflow_type.to_string(),
                reason: "definition has no stages".to_string(),
            });
        }

        Ok(definition)
    }
}
