// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by other chassis crates.
//!
//! This crate defines the stable device address and the controller/device
//! kind enumerations that the engine, its callers, and the declared-state
//! adapter all need, so that each can implement its own conversions without
//! any layering oddities.

use std::fmt::Display;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The class of bus controller a device attaches to.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ControllerClass {
    Ide,
    Pci,
    Scsi,
    Sata,
}

impl ControllerClass {
    /// Number of device slots one controller of this class exposes, not
    /// counting any reserved unit.
    pub fn slot_count(&self) -> u16 {
        match self {
            ControllerClass::Ide => 2,
            ControllerClass::Pci => 10,
            ControllerClass::Scsi => 15,
            ControllerClass::Sata => 30,
        }
    }

    /// Exclusive upper bound on unit numbers for this class. Differs from
    /// [`Self::slot_count`] only where a unit in the middle of the range is
    /// reserved.
    pub fn unit_limit(&self) -> u16 {
        match self {
            ControllerClass::Scsi => 16,
            other => other.slot_count(),
        }
    }

    /// The unit number the controller claims for itself, if any. Never
    /// assigned to a device.
    pub fn reserved_unit(&self) -> Option<u16> {
        match self {
            ControllerClass::Scsi => Some(7),
            _ => None,
        }
    }

    /// Number of buses (controllers) of this class one machine may have.
    pub fn bus_limit(&self) -> u16 {
        match self {
            ControllerClass::Ide => 2,
            ControllerClass::Pci => 1,
            ControllerClass::Scsi => 4,
            ControllerClass::Sata => 4,
        }
    }
}

/// The kinds of virtual device the engine manages.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
pub enum DeviceKind {
    #[strum(serialize = "disk")]
    Disk,
    #[strum(serialize = "network_interface")]
    NetworkInterface,
    #[strum(serialize = "cdrom")]
    OpticalDrive,
}

/// Errors arising from constructing or parsing a [`DeviceAddress`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("malformed device address {0:?}, expected <class>:<bus>:<unit>")]
    Malformed(String),

    #[error("unrecognized controller class {0:?}")]
    UnknownClass(String),

    #[error("{field} {value} outside range of 0-{max} for {class} controllers")]
    OutOfRange {
        class: ControllerClass,
        field: &'static str,
        value: u16,
        max: u16,
    },

    #[error("unit {unit} is reserved on {class} controllers")]
    ReservedUnit { class: ControllerClass, unit: u16 },
}

/// The durable identity of a device: the controller class and bus it
/// attaches to plus its unit number on that bus. Supports conversion from a
/// string formatted as "class:bus:unit", e.g. "scsi:0:3".
///
/// Unlike the numeric keys a hypervisor assigns, a device address survives
/// across sessions: bus and unit numbers are stable for the lifetime of
/// their controller. A device whose controller class or bus changes gets a
/// new address, which callers must treat as a new device.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, JsonSchema,
)]
pub struct DeviceAddress {
    class: ControllerClass,
    bus: u16,
    unit: u16,
}

impl DeviceAddress {
    pub fn new(
        class: ControllerClass,
        bus: u16,
        unit: u16,
    ) -> Result<Self, AddressError> {
        if bus >= class.bus_limit() {
            return Err(AddressError::OutOfRange {
                class,
                field: "bus",
                value: bus,
                max: class.bus_limit() - 1,
            });
        }

        if unit >= class.unit_limit() {
            return Err(AddressError::OutOfRange {
                class,
                field: "unit",
                value: unit,
                max: class.unit_limit() - 1,
            });
        }

        if class.reserved_unit() == Some(unit) {
            return Err(AddressError::ReservedUnit { class, unit });
        }

        Ok(Self { class, bus, unit })
    }

    #[inline]
    pub fn class(&self) -> ControllerClass {
        self.class
    }

    #[inline]
    pub fn bus(&self) -> u16 {
        self.bus
    }

    #[inline]
    pub fn unit(&self) -> u16 {
        self.unit
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(class), Some(bus), Some(unit), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AddressError::Malformed(s.to_owned()));
        };

        let class = ControllerClass::from_str(class)
            .map_err(|_| AddressError::UnknownClass(class.to_owned()))?;
        let bus = u16::from_str(bus)
            .map_err(|_| AddressError::Malformed(s.to_owned()))?;
        let unit = u16::from_str(unit)
            .map_err(|_| AddressError::Malformed(s.to_owned()))?;

        Self::new(class, bus, unit)
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.class, self.bus, self.unit)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{}", self).as_str())
    }
}

impl<'d> Deserialize<'d> for DeviceAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}
