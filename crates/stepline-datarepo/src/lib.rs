// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepline Data Repository - workflows over external data services
//!
//! Four workflows built on the stepline engine, each a fixed list of stages
//! calling the services in [`capability`]:
//!
//! | Workflow type | Stages |
//! |---------------|--------|
//! | `dataset.create` | catalog record, query-engine dataset, authorization resource, response |
//! | `file.ingest` | steward check, load-tag lock, verify dataset, choose location, copy, file record, unlock, response |
//! | `snapshot.authorize` | catalog lock, authorization resource and readers, query access, unlock |
//! | `dataset.data_delete` | dataset lock, external tables, soft deletes, drop external tables, unlock, response |
//!
//! Requests are submitted as a JSON document under the [`keys::REQUEST`]
//! input parameter (see [`flights::request_params`]); the final working map
//! carries the response under [`keys::RESPONSE`].
//!
//! ```ignore
//! let capabilities = Capabilities::new(persistence.clone(), catalog, query_engine, mover, authorizer);
//! let mut registry = WorkflowRegistry::new();
//! stepline_datarepo::register_all(&mut registry, capabilities);
//!
//! let engine = Engine::builder().persistence(persistence).registry(registry).build()?;
//! let id = engine
//!     .submit(flights::DATASET_CREATE, flights::request_params(&request)?)
//!     .await?;
//! ```

#![deny(missing_docs)]

/// External service interfaces.
pub mod capability;

/// Workflow definitions and their stages.
pub mod flights;

/// Parameter and working-map keys.
pub mod keys;

/// Requests, records and responses.
pub mod model;

use stepline_core::WorkflowRegistry;

pub use capability::{
    Authorizer, Capabilities, CapabilityError, CapabilityResult, Catalog, ObjectMover, QueryEngine,
};

/// Register all four workflow types, sharing `capabilities`.
pub fn register_all(registry: &mut WorkflowRegistry, capabilities: Capabilities) {
    let caps = capabilities.clone();
    registry.register(flights::DATASET_CREATE, move |params| {
        flights::dataset_create::definition(&caps, params)
    });

    let caps = capabilities.clone();
    registry.register(flights::FILE_INGEST, move |params| {
        flights::file_ingest::definition(&caps, params)
    });

    let caps = capabilities.clone();
    registry.register(flights::SNAPSHOT_AUTHORIZE, move |params| {
        flights::snapshot_authorize::definition(&caps, params)
    });

    registry.register(flights::DATA_DELETE, move |params| {
        flights::data_delete::definition(&capabilities, params)
    });
}
