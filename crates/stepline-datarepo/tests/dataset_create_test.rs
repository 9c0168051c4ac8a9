// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `dataset.create` against in-memory services.

mod common;

use common::*;
use stepline_core::{EngineError, InstanceStatus, ParamMap};
use stepline_datarepo::capability::codes;
use stepline_datarepo::flights::{self, DATASET_CREATE};
use stepline_datarepo::keys;
use stepline_datarepo::model::{DatasetSummary, ResourceRef, roles};
use stepline_datarepo::CapabilityError;

#[tokio::test]
async fn test_happy_path() {
    init_tracing();
    let fakes = Fakes::new().await;
    let engine = fakes.engine();

    let request = dataset_request("scftest_happy", &["participant", "sample"]);
    let id = engine
        .submit(DATASET_CREATE, flights::request_params(&request).unwrap())
        .await
        .unwrap();
    let state = engine.wait_for_instance_timeout(&id, TIMEOUT).await.unwrap();

    assert_eq!(state.status, InstanceStatus::Success);
    let response: DatasetSummary = state
        .result_map
        .unwrap()
        .get_typed(keys::RESPONSE)
        .unwrap();
    assert_eq!(response.name, "scftest_happy");

    let created = fakes.catalog.dataset_named("scftest_happy").unwrap();
    assert_eq!(created.id, response.id);
    assert_eq!(created.created_by, id);
    assert_eq!(created.tables.len(), 2);
    assert!(fakes.query_engine.has_dataset("scftest_happy"));

    let resource = ResourceRef::dataset(created.id);
    assert!(fakes.authorizer.has_resource(&resource));
    assert!(
        fakes
            .authorizer
            .has_grant(&resource, roles::STEWARD, "steward@example.org")
    );
}

#[tokio::test]
async fn test_undo_after_primary_data() {
    let fakes = Fakes::new().await;
    fakes.authorizer.faults.inject(
        "authz.create_resource",
        CapabilityError::Unauthorized("service account lacks admin".to_string()),
        1,
    );
    let engine = fakes.engine();

    let request = dataset_request("scftest_undo", &["participant"]);
    let id = engine
        .submit(DATASET_CREATE, flights::request_params(&request).unwrap())
        .await
        .unwrap();
    let state = engine.wait_for_instance_timeout(&id, TIMEOUT).await.unwrap();

    assert_eq!(state.status, InstanceStatus::Error);
    let error = state.error.unwrap();
    assert_eq!(error.code, codes::UNAUTHORIZED);
    assert_eq!(error.stage_index, Some(2));

    // Nothing the flight created survives.
    assert!(fakes.catalog.dataset_named("scftest_undo").is_none());
    assert!(!fakes.query_engine.has_dataset("scftest_undo"));
}

#[tokio::test]
async fn test_existing_name_is_a_conflict_and_left_alone() {
    let fakes = Fakes::new().await;
    let existing = fakes.seed_dataset("scftest_taken", &["participant"]);
    let engine = fakes.engine();

    let request = dataset_request("scftest_taken", &["sample"]);
    let id = engine
        .submit(DATASET_CREATE, flights::request_params(&request).unwrap())
        .await
        .unwrap();
    let state = engine.wait_for_instance_timeout(&id, TIMEOUT).await.unwrap();

    assert_eq!(state.status, InstanceStatus::Error);
    assert_eq!(state.error.unwrap().code, codes::CONFLICT);
    assert_eq!(fakes.catalog.dataset_named("scftest_taken"), Some(existing));
}

#[tokio::test]
async fn test_transient_query_engine_failure_is_retried() {
    let fakes = Fakes::new().await;
    fakes.query_engine.faults.inject(
        "query.create_dataset",
        CapabilityError::Transient("rate limited".to_string()),
        2,
    );
    let engine = fakes.engine();

    let request = dataset_request("scftest_retry", &["participant"]);
    let id = engine
        .submit(DATASET_CREATE, flights::request_params(&request).unwrap())
        .await
        .unwrap();
    let state = engine.wait_for_instance_timeout(&id, TIMEOUT).await.unwrap();

    assert_eq!(state.status, InstanceStatus::Success);
    assert!(fakes.query_engine.has_dataset("scftest_retry"));
}

#[tokio::test]
async fn test_persistent_transient_failure_unwinds_with_its_code() {
    let fakes = Fakes::new().await;
    fakes.query_engine.faults.inject(
        "query.create_dataset",
        CapabilityError::Transient("backend down".to_string()),
        10,
    );
    let engine = fakes.engine();

    let request = dataset_request("scftest_down", &["participant"]);
    let id = engine
        .submit(DATASET_CREATE, flights::request_params(&request).unwrap())
        .await
        .unwrap();
    let state = engine.wait_for_instance_timeout(&id, TIMEOUT).await.unwrap();

    assert_eq!(state.status, InstanceStatus::Error);
    assert_eq!(state.error.unwrap().code, codes::SERVICE_UNAVAILABLE);
    assert!(fakes.catalog.dataset_named("scftest_down").is_none());
}

#[tokio::test]
async fn test_invalid_request_is_rejected_at_submission() {
    let fakes = Fakes::new().await;
    let engine = fakes.engine();

    let request = dataset_request("bad name", &["participant"]);
    let err = engine
        .submit(DATASET_CREATE, flights::request_params(&request).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidWorkflow { .. }));

    let err = engine
        .submit(DATASET_CREATE, ParamMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidWorkflow { .. }));
    assert!(err.to_string().contains(keys::REQUEST));
}
