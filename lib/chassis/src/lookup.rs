// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Locating devices by stable address.
//!
//! The hypervisor keys devices by an opaque controller key that is only
//! valid within a session, while a [`DeviceAddress`] uses the
//! session-independent bus number. Resolution is therefore two-stage:
//! first the unique controller matching (class, bus), then the unique
//! device on that controller's key at the addressed unit. More than one
//! match at either stage means the live list is inconsistent, which is
//! fatal rather than retryable.

use chassis_types::{ControllerClass, DeviceAddress};
use thiserror::Error;

use crate::hardware::{Controller, DeviceList, VirtualDevice};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("no {class} controller on bus {bus}")]
    ControllerNotFound { class: ControllerClass, bus: u16 },

    #[error("multiple {class} controllers claim bus {bus}")]
    AmbiguousController { class: ControllerClass, bus: u16 },

    #[error("no device at {0}")]
    DeviceNotFound(DeviceAddress),

    #[error("multiple devices at {0}")]
    AmbiguousDevice(DeviceAddress),
}

/// Finds the unique controller matching a class and bus number.
pub fn find_controller<'a>(
    list: &'a DeviceList,
    class: ControllerClass,
    bus: u16,
) -> Result<&'a Controller, LookupError> {
    let mut matches = list
        .controllers()
        .filter(|c| c.class == class && c.bus_number == bus);

    let first =
        matches.next().ok_or(LookupError::ControllerNotFound { class, bus })?;
    if matches.next().is_some() {
        return Err(LookupError::AmbiguousController { class, bus });
    }
    Ok(first)
}

fn position(
    list: &DeviceList,
    address: &DeviceAddress,
) -> Result<usize, LookupError> {
    let controller =
        find_controller(list, address.class(), address.bus())?;
    let controller_key = controller.key;
    let unit = address.unit();

    let positions = list.position_of(|d| {
        d.controller_key() == Some(controller_key)
            && d.unit_number() == Some(unit)
    });

    match positions.as_slice() {
        [] => Err(LookupError::DeviceNotFound(*address)),
        [one] => Ok(*one),
        _ => Err(LookupError::AmbiguousDevice(*address)),
    }
}

/// Finds the unique device a stable address resolves to.
pub fn find<'a>(
    list: &'a DeviceList,
    address: &DeviceAddress,
) -> Result<&'a VirtualDevice, LookupError> {
    position(list, address).map(|i| list.entry_at(i))
}
