// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declared device state.
//!
//! This module defines the engine's internal view of what the user asked
//! for: typed attribute structs per device kind, keyed by `(kind, index)`.
//! Unlike the wire types in [`crate::hardware`], these are never
//! serialized; the external declared-state store addresses attributes by
//! string paths of the form `<kind>.<index>.<attribute>`, and that
//! indirection is confined to [`AttributePath`] here so everything else
//! stays typed.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use chassis_types::{ControllerClass, DeviceAddress, DeviceKind};
use thiserror::Error;
use uuid::Uuid;

use crate::hardware::{
    AdapterType, DiskProvisioning, MacPolicy, OpticalBacking, ShareAllocation,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeclaredError {
    #[error("{kind} {index} is declared more than once")]
    DuplicateIndex { kind: DeviceKind, index: u32 },

    #[error("malformed attribute path {0:?}, expected <kind>.<index>.<attribute>")]
    MalformedPath(String),
}

/// Declared configuration of one disk.
#[derive(Clone, Debug, PartialEq)]
pub struct DiskAttributes {
    pub controller_class: ControllerClass,
    pub capacity_kib: u64,
    pub provisioning: DiskProvisioning,

    /// Path of an existing backing file to attach. `None` asks the engine
    /// to create a fresh backing on the datastore.
    pub backing_path: Option<String>,

    pub datastore: Uuid,
    pub write_through: bool,

    /// Detach without destroying the backing file on removal.
    pub keep_backing_on_remove: bool,
}

/// Declared configuration of one network interface.
#[derive(Clone, Debug, PartialEq)]
pub struct NicAttributes {
    pub adapter: AdapterType,
    pub mac: MacPolicy,
    pub bandwidth: ShareAllocation,
    pub network: Uuid,
}

/// Declared configuration of one optical drive.
#[derive(Clone, Debug, PartialEq)]
pub struct OpticalAttributes {
    pub controller_class: ControllerClass,
    pub backing: OpticalBacking,
}

/// Kind-specific attributes of a declared device.
#[derive(Clone, Debug, PartialEq)]
pub enum DeclaredAttributes {
    Disk(DiskAttributes),
    Nic(NicAttributes),
    Optical(OpticalAttributes),
}

impl DeclaredAttributes {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeclaredAttributes::Disk(_) => DeviceKind::Disk,
            DeclaredAttributes::Nic(_) => DeviceKind::NetworkInterface,
            DeclaredAttributes::Optical(_) => DeviceKind::OpticalDrive,
        }
    }
}

/// One declared device: a user-assigned index distinguishing same-kind
/// devices, the stable address recorded by the previous pass (if the
/// device existed then), and the desired attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct DeclaredDevice {
    pub index: u32,
    pub address: Option<DeviceAddress>,
    pub attributes: DeclaredAttributes,
}

impl DeclaredDevice {
    pub fn kind(&self) -> DeviceKind {
        self.attributes.kind()
    }
}

/// A set of declared devices keyed by `(kind, index)`, as supplied by the
/// declared-state store for one side (old or new) of a pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeclaredSet {
    entries: BTreeMap<(DeviceKind, u32), DeclaredDevice>,
}

impl DeclaredSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a declared device, rejecting a `(kind, index)` collision
    /// rather than silently replacing the earlier entry.
    pub fn insert(
        &mut self,
        device: DeclaredDevice,
    ) -> Result<(), DeclaredError> {
        let key = (device.kind(), device.index);
        if self.entries.contains_key(&key) {
            return Err(DeclaredError::DuplicateIndex {
                kind: key.0,
                index: key.1,
            });
        }
        self.entries.insert(key, device);
        Ok(())
    }

    pub fn get(
        &self,
        kind: DeviceKind,
        index: u32,
    ) -> Option<&DeclaredDevice> {
        self.entries.get(&(kind, index))
    }

    pub fn contains(&self, kind: DeviceKind, index: u32) -> bool {
        self.entries.contains_key(&(kind, index))
    }

    /// Entries in `(kind, index)` order.
    pub fn iter(&self) -> impl Iterator<Item = &DeclaredDevice> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = (DeviceKind, u32)> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves an external-store attribute path to the declared device
    /// that owns it.
    pub fn get_by_path(&self, path: &AttributePath) -> Option<&DeclaredDevice> {
        self.get(path.kind, path.index)
    }
}

/// An attribute address in the external declared-state store, e.g.
/// `disk.0.capacity_kib`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributePath {
    pub kind: DeviceKind,
    pub index: u32,
    pub attribute: String,
}

impl Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.index, self.attribute)
    }
}

impl FromStr for AttributePath {
    type Err = DeclaredError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || DeclaredError::MalformedPath(s.to_owned());

        let (kind, rest) = s.split_once('.').ok_or_else(malformed)?;
        let (index, attribute) = rest.split_once('.').ok_or_else(malformed)?;

        let kind = DeviceKind::from_str(kind).map_err(|_| malformed())?;
        let index = u32::from_str(index).map_err(|_| malformed())?;
        if attribute.is_empty() {
            return Err(malformed());
        }

        Ok(Self { kind, index, attribute: attribute.to_owned() })
    }
}
