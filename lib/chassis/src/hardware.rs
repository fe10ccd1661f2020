// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The live device-list object model.
//!
//! These types mirror what the hypervisor reports when queried for a
//! machine's attached hardware: a flat, ordered list of controllers and
//! devices, each carrying a numeric key that is only meaningful within the
//! current session. [`DeviceList`] is the single working copy one
//! reconciliation pass mutates; applying a mutation here keeps the copy
//! consistent with what the remote reconfiguration call will produce
//! without a round trip.

use chassis_types::{ControllerClass, DeviceKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::mutation::{DeviceMutation, MutationOp};

/// Keys at or below this value denote devices synthesized during the
/// current pass and not yet known to the hypervisor.
pub const PROVISIONAL_KEY_START: i32 = -100;

/// A bus controller to which devices attach.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Controller {
    pub key: i32,
    pub class: ControllerClass,
    pub bus_number: u16,
}

/// How a disk's backing file is provisioned on its datastore.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DiskProvisioning {
    Thin,
    Thick,
    ThickEagerlyScrubbed,
}

/// The file backing a disk.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DiskBacking {
    /// Path of the backing file, e.g. `[store1] vm/vm-disk0.vmdk`.
    pub file_path: String,

    /// The datastore holding the backing file.
    pub datastore: Uuid,

    /// Bypass the hypervisor's write cache for this disk.
    pub write_through: bool,
}

/// A virtual disk.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: u16,
    pub capacity_kib: u64,
    pub provisioning: DiskProvisioning,
    pub backing: DiskBacking,
}

/// The emulated NIC hardware presented to the guest.
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
pub enum AdapterType {
    E1000,
    Vmxnet3,
}

/// How a NIC's MAC address is assigned.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MacPolicy {
    /// The hypervisor picks an address when the device is created.
    Generated,

    /// The caller supplies the address.
    Manual { address: String },
}

/// Relative share of outbound bandwidth granted to a NIC.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ShareAllocation {
    Low,
    Normal,
    High,
    Custom(u32),
}

/// A virtual network interface. Always attaches to the PCI controller.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NetworkInterface {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: u16,
    pub adapter: AdapterType,
    pub mac: MacPolicy,
    pub bandwidth: ShareAllocation,

    /// The network this interface connects to.
    pub network: Uuid,
}

/// What an optical drive presents to the guest.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OpticalBacking {
    /// An ISO image on a datastore.
    DatastoreIso { file_path: String, datastore: Uuid },

    /// Pass through the client's physical drive.
    ClientDevice,
}

/// A virtual optical drive.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OpticalDrive {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: u16,
    pub backing: OpticalBacking,
}

/// One entry in a machine's device list. New device kinds are added as
/// variants here; nothing outside this module branches on anything but the
/// closed set below.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VirtualDevice {
    Controller(Controller),
    Disk(Disk),
    Nic(NetworkInterface),
    Optical(OpticalDrive),
}

impl VirtualDevice {
    /// The entry's volatile key.
    pub fn key(&self) -> i32 {
        match self {
            VirtualDevice::Controller(c) => c.key,
            VirtualDevice::Disk(d) => d.key,
            VirtualDevice::Nic(n) => n.key,
            VirtualDevice::Optical(o) => o.key,
        }
    }

    /// The controller this entry attaches to, or `None` for controllers
    /// themselves.
    pub fn controller_key(&self) -> Option<i32> {
        match self {
            VirtualDevice::Controller(_) => None,
            VirtualDevice::Disk(d) => Some(d.controller_key),
            VirtualDevice::Nic(n) => Some(n.controller_key),
            VirtualDevice::Optical(o) => Some(o.controller_key),
        }
    }

    /// The entry's slot on its controller, or `None` for controllers.
    pub fn unit_number(&self) -> Option<u16> {
        match self {
            VirtualDevice::Controller(_) => None,
            VirtualDevice::Disk(d) => Some(d.unit_number),
            VirtualDevice::Nic(n) => Some(n.unit_number),
            VirtualDevice::Optical(o) => Some(o.unit_number),
        }
    }

    pub fn device_kind(&self) -> Option<DeviceKind> {
        match self {
            VirtualDevice::Controller(_) => None,
            VirtualDevice::Disk(_) => Some(DeviceKind::Disk),
            VirtualDevice::Nic(_) => Some(DeviceKind::NetworkInterface),
            VirtualDevice::Optical(_) => Some(DeviceKind::OpticalDrive),
        }
    }

    pub fn as_controller(&self) -> Option<&Controller> {
        match self {
            VirtualDevice::Controller(c) => Some(c),
            _ => None,
        }
    }
}

/// Errors applying a [`DeviceMutation`] to a [`DeviceList`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("an entry with key {0} is already in the device list")]
    DuplicateKey(i32),

    #[error("no entry with key {0} in the device list")]
    UnknownKey(i32),
}

/// The ordered set of controllers and devices attached to one machine, as
/// of a point in time.
///
/// A reconciliation pass owns exactly one of these and threads `&mut`
/// access through each operation, so effects of earlier operations (a
/// freshly added controller, a freed slot) are visible to later ones.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeviceList {
    entries: Vec<VirtualDevice>,

    #[serde(default = "provisional_start", skip)]
    next_provisional: i32,
}

fn provisional_start() -> i32 {
    PROVISIONAL_KEY_START
}

impl Default for DeviceList {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DeviceList {
    pub fn new(entries: Vec<VirtualDevice>) -> Self {
        Self { entries, next_provisional: PROVISIONAL_KEY_START }
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn controllers(&self) -> impl Iterator<Item = &Controller> {
        self.entries.iter().filter_map(VirtualDevice::as_controller)
    }

    /// Non-controller entries attached to the controller with `key`.
    pub fn devices_on(
        &self,
        key: i32,
    ) -> impl Iterator<Item = &VirtualDevice> {
        self.entries.iter().filter(move |d| d.controller_key() == Some(key))
    }

    pub fn entry(&self, key: i32) -> Option<&VirtualDevice> {
        self.entries.iter().find(|d| d.key() == key)
    }

    pub(crate) fn entry_at(&self, index: usize) -> &VirtualDevice {
        &self.entries[index]
    }

    pub(crate) fn position_of<P>(&self, pred: P) -> Vec<usize>
    where
        P: Fn(&VirtualDevice) -> bool,
    {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, d)| pred(d).then_some(i))
            .collect()
    }

    /// Reserves a fresh provisional key for a device synthesized during
    /// this pass. Keys are unique within one pass and distinguishable from
    /// hypervisor-assigned (non-negative) keys.
    pub fn reserve_key(&mut self) -> i32 {
        let key = self.next_provisional;
        self.next_provisional -= 1;
        key
    }

    /// Applies one mutation to the working list: adds append, edits replace
    /// the entry with the matching key, removes delete it.
    pub fn apply(
        &mut self,
        mutation: &DeviceMutation,
    ) -> Result<(), ApplyError> {
        let key = mutation.device.key();
        match mutation.op {
            MutationOp::Add => {
                if self.entries.iter().any(|d| d.key() == key) {
                    return Err(ApplyError::DuplicateKey(key));
                }
                self.entries.push(mutation.device.clone());
            }
            MutationOp::Edit => {
                let entry = self
                    .entries
                    .iter_mut()
                    .find(|d| d.key() == key)
                    .ok_or(ApplyError::UnknownKey(key))?;
                *entry = mutation.device.clone();
            }
            MutationOp::Remove => {
                let pos = self
                    .entries
                    .iter()
                    .position(|d| d.key() == key)
                    .ok_or(ApplyError::UnknownKey(key))?;
                self.entries.remove(pos);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mutation::DeviceMutation;

    fn scsi_controller(key: i32, bus: u16) -> VirtualDevice {
        VirtualDevice::Controller(Controller {
            key,
            class: ControllerClass::Scsi,
            bus_number: bus,
        })
    }

    fn disk(key: i32, controller_key: i32, unit: u16) -> VirtualDevice {
        VirtualDevice::Disk(Disk {
            key,
            controller_key,
            unit_number: unit,
            capacity_kib: 1 << 20,
            provisioning: DiskProvisioning::Thin,
            backing: DiskBacking {
                file_path: format!("[store1] vm/disk{key}.vmdk"),
                datastore: Uuid::from_u128(1),
                write_through: false,
            },
        })
    }

    #[test]
    fn apply_add_edit_remove() {
        let mut list = DeviceList::new(vec![scsi_controller(1000, 0)]);

        list.apply(&DeviceMutation::add(disk(2000, 1000, 0))).unwrap();
        assert_eq!(list.len(), 2);

        let mut edited = disk(2000, 1000, 0);
        if let VirtualDevice::Disk(d) = &mut edited {
            d.capacity_kib = 2 << 20;
        }
        list.apply(&DeviceMutation::edit(edited)).unwrap();
        match list.entry(2000).unwrap() {
            VirtualDevice::Disk(d) => assert_eq!(d.capacity_kib, 2 << 20),
            other => panic!("unexpected entry {other:?}"),
        }

        list.apply(&DeviceMutation::remove(disk(2000, 1000, 0))).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.entry(2000).is_none());
    }

    #[test]
    fn apply_rejects_duplicate_and_unknown_keys() {
        let mut list = DeviceList::new(vec![scsi_controller(1000, 0)]);

        assert_eq!(
            list.apply(&DeviceMutation::add(scsi_controller(1000, 1))),
            Err(ApplyError::DuplicateKey(1000))
        );
        assert_eq!(
            list.apply(&DeviceMutation::edit(disk(2000, 1000, 0))),
            Err(ApplyError::UnknownKey(2000))
        );
        assert_eq!(
            list.apply(&DeviceMutation::remove(disk(2000, 1000, 0))),
            Err(ApplyError::UnknownKey(2000))
        );
    }

    #[test]
    fn provisional_keys_are_unique_and_negative() {
        let mut list = DeviceList::default();
        let a = list.reserve_key();
        let b = list.reserve_key();
        assert!(a <= PROVISIONAL_KEY_START);
        assert!(b < a);
    }
}
