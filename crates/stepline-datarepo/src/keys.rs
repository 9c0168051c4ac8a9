// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parameter and working-map keys shared by the data-repository stages.

/// Input parameter holding the JSON request document.
pub const REQUEST: &str = "request";

/// Working map: the final response document.
pub const RESPONSE: &str = "response";

/// Working map: catalog id of the dataset being created.
pub const DATASET_ID: &str = "dataset_id";

/// Working map: id assigned to the file being ingested.
pub const FILE_ID: &str = "file_id";

/// Working map: where the file's bytes are copied to.
pub const TARGET_LOCATION: &str = "target_location";

/// Working map: size and checksum of the copied object.
pub const FILE_INFO: &str = "file_info";

/// Working map: rows marked deleted so far.
pub const ROWS_DELETED: &str = "rows_deleted";
