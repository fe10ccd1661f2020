// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device mutations: the wire contract for one batch reconfiguration call.
//!
//! A reconciliation pass yields an ordered `Vec<DeviceMutation>` which the
//! submission layer hands to the hypervisor as a single transactional
//! configuration change. The hypervisor accepts or rejects the whole batch.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::hardware::VirtualDevice;

/// What to do with the carried device.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MutationOp {
    Add,
    Edit,
    Remove,
}

/// A side effect on a device's backing file, carried alongside an add or
/// remove of a disk.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileOperation {
    Create,
    Destroy,
}

/// One add/edit/remove instruction destined for the hypervisor's batch
/// reconfiguration call, carrying the fully-populated device payload.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeviceMutation {
    pub op: MutationOp,
    pub device: VirtualDevice,
    pub file_op: Option<FileOperation>,
}

impl DeviceMutation {
    pub fn add(device: VirtualDevice) -> Self {
        Self { op: MutationOp::Add, device, file_op: None }
    }

    pub fn edit(device: VirtualDevice) -> Self {
        Self { op: MutationOp::Edit, device, file_op: None }
    }

    pub fn remove(device: VirtualDevice) -> Self {
        Self { op: MutationOp::Remove, device, file_op: None }
    }

    pub fn with_file_op(mut self, file_op: FileOperation) -> Self {
        self.file_op = Some(file_op);
        self
    }
}
