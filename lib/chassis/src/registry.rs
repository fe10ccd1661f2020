// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The stable-identity registry.
//!
//! Each declared index is bound to the address it resolved to on the last
//! pass. Before a new pass touches anything, the guard rejects any index
//! that is now declared with a different address: reordering declarations
//! must not silently hand one device's identity to another. The caller
//! persists the registry alongside declared state between passes.

use std::collections::BTreeMap;

use chassis_types::{DeviceAddress, DeviceKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::declared::DeclaredSet;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error(
        "{kind} {index} held identity {held} but is now declared as {declared}"
    )]
    IdentityReuseConflict {
        kind: DeviceKind,
        index: u32,
        held: DeviceAddress,
        declared: DeviceAddress,
    },
}

/// Mapping from declared index to the address it last resolved to.
///
/// Keys take the external store's `<kind>.<index>` form so the persisted
/// registry reads the same way as the attribute paths around it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct IdentityRegistry {
    bindings: BTreeMap<String, DeviceAddress>,
}

fn binding_key(kind: DeviceKind, index: u32) -> String {
    format!("{kind}.{index}")
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the address an index resolved to.
    pub fn record(
        &mut self,
        kind: DeviceKind,
        index: u32,
        address: DeviceAddress,
    ) {
        self.bindings.insert(binding_key(kind, index), address);
    }

    /// The address an index held after the last pass, if any.
    pub fn held(&self, kind: DeviceKind, index: u32) -> Option<DeviceAddress> {
        self.bindings.get(&binding_key(kind, index)).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Pre-flight check: every index present in both the registry and the
    /// new declared set must still carry the address it held. Mutates
    /// nothing.
    pub fn validate(&self, new: &DeclaredSet) -> Result<(), RegistryError> {
        for device in new.iter() {
            let Some(declared) = device.address else {
                continue;
            };
            let Some(held) = self.held(device.kind(), device.index) else {
                continue;
            };
            if held != declared {
                return Err(RegistryError::IdentityReuseConflict {
                    kind: device.kind(),
                    index: device.index,
                    held,
                    declared,
                });
            }
        }
        Ok(())
    }

    /// Rebuilds the registry from the declared set a successful pass
    /// produced, recording every entry that has an address.
    pub fn rebuild(declared: &DeclaredSet) -> Self {
        let mut registry = Self::new();
        for device in declared.iter() {
            if let Some(address) = device.address {
                registry.record(device.kind(), device.index, address);
            }
        }
        registry
    }
}
