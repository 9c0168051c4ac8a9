// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepline Core - Durable Saga Engine
//!
//! This crate runs workflows made of ordered stages, each with a forward
//! action and a compensating action. Progress is persisted after every stage
//! so a restarted process picks up where the previous one stopped, and a
//! failed workflow is unwound by compensating its stages in reverse order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Callers (request handlers, CLI)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!              │ submit / wait_for_instance / get_instance_state
//!              ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                      │
//! │     WorkflowRegistry ──► WorkflowDefinition ──► worker pool (tokio)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!              │ one task per instance          │ checkpoints, locks
//!              ▼                                ▼
//! ┌───────────────────────┐        ┌─────────────────────────────────────┐
//! │  Stages (run /        │        │  Persistence (SQLite / PostgreSQL)  │
//! │  compensate)          │        │  workflow_instances, resource_locks │
//! └───────────────────────┘        └─────────────────────────────────────┘
//! ```
//!
//! # Instance Status State Machine
//!
//! ```text
//!      ┌────────┐  worker   ┌─────────┐  all stages ok   ┌─────────┐
//!      │ QUEUED │──────────►│ RUNNING │─────────────────►│ SUCCESS │
//!      └────────┘           └────┬────┘                  └─────────┘
//!                                │ stage fatal / retries exhausted
//!                                ▼
//!                        RUNNING (direction = undo)
//!                                │
//!               ┌────────────────┴───────────────┐
//!     all compensations ok              a compensation fails
//!               ▼                                ▼
//!          ┌─────────┐                      ┌─────────┐
//!          │  ERROR  │                      │  FATAL  │
//!          └─────────┘                      └─────────┘
//! ```
//!
//! | Status | Description |
//! |--------|-------------|
//! | `queued` | Persisted, waiting for a worker permit |
//! | `running` | Executing forward or compensating |
//! | `success` | Every stage ran; result map holds the final working map |
//! | `error` | A stage failed and every stage was compensated |
//! | `fatal` | A compensation failed; needs operator attention |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STEPLINE_DATABASE_URL` | Yes | - | `sqlite:` or `postgres://` URL |
//! | `STEPLINE_MAX_WORKERS` | No | `8` | Concurrently executing instances |
//! | `STEPLINE_WAIT_POLL_INTERVAL_MS` | No | `500` | Waiter poll interval |
//! | `STEPLINE_MAX_DB_CONNECTIONS` | No | `5` | Database pool size |
//!
//! # Modules
//!
//! - [`engine`]: submission, worker pool, recovery, waiting
//! - [`definition`]: workflow definitions and the type registry
//! - [`stage`]: the stage trait and stage errors
//! - [`context`]: what a stage sees while it runs
//! - [`value`]: the typed parameter map
//! - [`retry`]: retry policies
//! - [`lock`]: resource lock stages
//! - [`persistence`]: storage interface and SQL backends

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Per-instance execution context.
pub mod context;

/// Workflow definitions and registry.
pub mod definition;

/// The engine and its worker pool.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Resource lock stages.
pub mod lock;

/// Embedded database migrations.
pub mod migrations;

/// Durable storage for instances and locks.
pub mod persistence;

/// Retry policies.
pub mod retry;

/// The stage contract.
pub mod stage;

/// Typed parameter and working maps.
pub mod value;

pub use config::{Config, ConfigError};
pub use context::{Direction, StageContext};
pub use definition::{BuildError, StageEntry, WorkflowDefinition, WorkflowRegistry};
pub use engine::{Engine, EngineBuilder, InstanceState};
pub use error::{EngineError, Result};
pub use lock::{AcquireLockStage, ReleaseLockStage};
pub use persistence::{InstanceError, InstanceRecord, InstanceStatus, Persistence};
pub use retry::{RetryDecision, RetryPolicy};
pub use stage::{Stage, StageError, StageErrorKind, StageResult};
pub use value::{MapError, ParamMap, ParamValue};
