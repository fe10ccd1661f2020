// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller allocation.
//!
//! Placing a device means finding a controller of the requested class with
//! a free unit, or describing the creation of a new one. A synthesized
//! controller carries a provisional (negative) key so later logic can tell
//! "needs to be added to the outgoing change list" from "already exists";
//! the pending add it implies travels with the placement and is applied to
//! the working list by the caller before any device attaches to it.

use chassis_types::{AddressError, ControllerClass, DeviceAddress};
use thiserror::Error;

use crate::hardware::{Controller, DeviceList, VirtualDevice};
use crate::mutation::DeviceMutation;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AllocateError {
    /// Every allowed bus of the class exists and every unit is taken.
    /// A config asking for this many devices can never apply; not retried.
    #[error(
        "all {limit} {class} controllers are full ({slots} units each)"
    )]
    BusFull { class: ControllerClass, limit: u16, slots: u16 },

    #[error(transparent)]
    Address(#[from] AddressError),
}

/// Where a new device will attach.
#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    /// Key of the chosen controller; provisional if it was synthesized.
    pub controller_key: i32,

    /// The stable address of the chosen slot.
    pub address: DeviceAddress,

    /// Controller-add mutation implied by the allocation, if any. Empty
    /// when an existing controller had a free slot.
    pub pending: Vec<DeviceMutation>,
}

/// Picks the slot for a new device of the given controller class.
///
/// Existing controllers are scanned in bus order and the lowest free unit
/// wins, skipping any unit the class reserves for the controller itself.
/// Only when every existing controller of the class is full is a new one
/// synthesized, on the lowest unused bus number.
pub fn allocate(
    list: &mut DeviceList,
    class: ControllerClass,
) -> Result<Placement, AllocateError> {
    let mut controllers: Vec<&Controller> =
        list.controllers().filter(|c| c.class == class).collect();
    controllers.sort_by_key(|c| c.bus_number);

    for &ctrl in &controllers {
        if let Some(unit) = free_unit(list, ctrl) {
            return Ok(Placement {
                controller_key: ctrl.key,
                address: DeviceAddress::new(class, ctrl.bus_number, unit)?,
                pending: Vec::new(),
            });
        }
    }

    let bus_number = (0..class.bus_limit())
        .find(|bus| !controllers.iter().any(|c| c.bus_number == *bus))
        .ok_or(AllocateError::BusFull {
            class,
            limit: class.bus_limit(),
            slots: class.slot_count(),
        })?;

    let address = DeviceAddress::new(class, bus_number, first_unit(class))?;
    let key = list.reserve_key();
    let controller = Controller { key, class, bus_number };

    Ok(Placement {
        controller_key: key,
        address,
        pending: vec![DeviceMutation::add(VirtualDevice::Controller(
            controller,
        ))],
    })
}

fn first_unit(class: ControllerClass) -> u16 {
    if class.reserved_unit() == Some(0) {
        1
    } else {
        0
    }
}

fn free_unit(list: &DeviceList, ctrl: &Controller) -> Option<u16> {
    let used: Vec<u16> =
        list.devices_on(ctrl.key).filter_map(|d| d.unit_number()).collect();

    (0..ctrl.class.unit_limit())
        .filter(|unit| ctrl.class.reserved_unit() != Some(*unit))
        .find(|unit| !used.contains(unit))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hardware::{
        Disk, DiskBacking, DiskProvisioning, PROVISIONAL_KEY_START,
    };
    use uuid::Uuid;

    fn controller(key: i32, class: ControllerClass, bus: u16) -> VirtualDevice {
        VirtualDevice::Controller(Controller { key, class, bus_number: bus })
    }

    fn disk_at(key: i32, controller_key: i32, unit: u16) -> VirtualDevice {
        VirtualDevice::Disk(Disk {
            key,
            controller_key,
            unit_number: unit,
            capacity_kib: 4096,
            provisioning: DiskProvisioning::Thin,
            backing: DiskBacking {
                file_path: format!("[store1] vm/disk{key}.vmdk"),
                datastore: Uuid::from_u128(1),
                write_through: false,
            },
        })
    }

    #[test]
    fn reuses_controller_with_free_slot() {
        let mut list = DeviceList::new(vec![
            controller(1000, ControllerClass::Scsi, 0),
            disk_at(2000, 1000, 0),
            disk_at(2001, 1000, 1),
        ]);

        let placement = allocate(&mut list, ControllerClass::Scsi).unwrap();
        assert!(placement.pending.is_empty());
        assert_eq!(placement.controller_key, 1000);
        assert_eq!(placement.address.to_string(), "scsi:0:2");
    }

    #[test]
    fn skips_reserved_scsi_unit() {
        let devices: Vec<VirtualDevice> =
            std::iter::once(controller(1000, ControllerClass::Scsi, 0))
                .chain(
                    (0..7).map(|u| disk_at(2000 + i32::from(u), 1000, u)),
                )
                .collect();
        let mut list = DeviceList::new(devices);

        // Units 0-6 are taken and 7 is the controller's own; next is 8.
        let placement = allocate(&mut list, ControllerClass::Scsi).unwrap();
        assert_eq!(placement.address.to_string(), "scsi:0:8");
    }

    #[test]
    fn full_controller_gets_provisional_sibling() {
        let devices: Vec<VirtualDevice> =
            std::iter::once(controller(1000, ControllerClass::Ide, 0))
                .chain((0..2).map(|u| disk_at(2000 + i32::from(u), 1000, u)))
                .collect();
        let mut list = DeviceList::new(devices);

        let placement = allocate(&mut list, ControllerClass::Ide).unwrap();
        assert_eq!(placement.pending.len(), 1);
        assert!(placement.controller_key <= PROVISIONAL_KEY_START);
        assert_eq!(placement.address.to_string(), "ide:1:0");

        match &placement.pending[0].device {
            VirtualDevice::Controller(c) => {
                assert_eq!(c.key, placement.controller_key);
                assert_eq!(c.bus_number, 1);
            }
            other => panic!("unexpected pending device {other:?}"),
        }
    }

    #[test]
    fn exhausted_class_is_an_error() {
        // Both IDE buses exist and are full.
        let mut devices = vec![
            controller(1000, ControllerClass::Ide, 0),
            controller(1001, ControllerClass::Ide, 1),
        ];
        devices.extend((0..2).map(|u| disk_at(2000 + i32::from(u), 1000, u)));
        devices.extend((0..2).map(|u| disk_at(2010 + i32::from(u), 1001, u)));
        let mut list = DeviceList::new(devices);

        assert_eq!(
            allocate(&mut list, ControllerClass::Ide),
            Err(AllocateError::BusFull {
                class: ControllerClass::Ide,
                limit: 2,
                slots: 2
            })
        );
    }

    #[test]
    fn empty_list_synthesizes_bus_zero() {
        let mut list = DeviceList::default();
        let placement = allocate(&mut list, ControllerClass::Sata).unwrap();
        assert_eq!(placement.address.to_string(), "sata:0:0");
        assert_eq!(placement.pending.len(), 1);
    }
}
