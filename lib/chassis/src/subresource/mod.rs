// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-device-kind lifecycle contract.
//!
//! Every device kind implements [`Subresource`]: create, read, update, and
//! delete against the pass's working [`DeviceList`]. Operations mutate the
//! list in place as they go, so a controller added for one device is
//! visible to the next, and return the wire mutations they imply for the
//! driver to accumulate. New kinds are added by implementing the trait and
//! extending [`subresource_for`]; nothing else branches on device kind.
//!
//! No operation retries internally. Every error is terminal for the pass
//! and propagates to the driver, which annotates it with the failing
//! kind and index.

use chassis_types::{AddressError, ControllerClass, DeviceAddress, DeviceKind};
use thiserror::Error;

use crate::allocator::AllocateError;
use crate::declared::DeclaredDevice;
use crate::hardware::{ApplyError, DeviceList};
use crate::lookup::LookupError;
use crate::mutation::DeviceMutation;
use crate::resolver::{DatastoreResolver, NetworkResolver, ResolveError};

mod disk;
mod nic;
mod optical;

pub use disk::DiskSubresource;
pub use nic::NicSubresource;
pub use optical::OpticalSubresource;

/// Errors raised by subresource operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Allocate(#[from] AllocateError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("no {0}-state declaration for this device")]
    Undeclared(&'static str),

    #[error("declared attributes are not for a {expected}")]
    AttributeKindMismatch { expected: DeviceKind },

    #[error("device has never been assigned an address")]
    Unplaced,

    #[error("the device at {address} is not a {expected}")]
    WrongDeviceKind { address: DeviceAddress, expected: DeviceKind },

    #[error("{attribute} cannot change without recreating the device")]
    ForbiddenChange { attribute: &'static str },

    #[error("declared capacity {declared} KiB is below current {current} KiB")]
    ShrinkNotAllowed { declared: u64, current: u64 },

    #[error("{class} controllers cannot host a {kind}")]
    InvalidControllerClass { kind: DeviceKind, class: ControllerClass },

    #[error("invalid mac address {0:?}")]
    InvalidMacAddress(String),
}

/// Shared collaborators for subresource operations: a structured logger,
/// the machine's name (used when generating backing file paths), and the
/// external object resolvers.
pub struct SubresourceCtx<'a> {
    pub log: slog::Logger,
    pub vm_name: &'a str,
    pub datastores: &'a dyn DatastoreResolver,
    pub networks: &'a dyn NetworkResolver,
}

impl<'a> SubresourceCtx<'a> {
    pub fn new(
        log: &slog::Logger,
        vm_name: &'a str,
        datastores: &'a dyn DatastoreResolver,
        networks: &'a dyn NetworkResolver,
    ) -> Self {
        Self {
            log: log.new(slog::o!("vm" => vm_name.to_owned())),
            vm_name,
            datastores,
            networks,
        }
    }
}

/// Uniform lifecycle operations over one declared device.
///
/// An implementation holds the declared old and new states for its device
/// and is driven through exactly one of the operations per pass. The
/// mutations an operation returns have already been applied to the working
/// list; the caller accumulates them for the hypervisor submission.
pub trait Subresource {
    /// Allocates a slot, constructs the device, stamps its new address
    /// into the declared mirror, and adds it to the working list.
    fn create(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError>;

    /// Copies the live device's observed attributes into the declared
    /// mirror. Used for drift detection and import; mutates no hardware
    /// state.
    fn read(&mut self, list: &DeviceList) -> Result<(), DeviceError>;

    /// Applies declared attribute changes: in-place where the hypervisor
    /// allows it, remove-and-recreate (with a fresh address) where it does
    /// not, and a veto for attributes that can never change.
    fn update(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError>;

    /// Detaches the device from the working list.
    fn delete(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError>;

    /// Consumes the subresource, yielding the updated new-side declared
    /// state (if the device still exists after the operation).
    fn into_declared(self: Box<Self>) -> Option<DeclaredDevice>;
}

/// Builds the subresource for a declared device's kind. `old`/`new` are
/// the two sides of the pass for that `(kind, index)`; at least one must
/// be present and both must match `kind`.
pub fn subresource_for(
    kind: DeviceKind,
    old: Option<DeclaredDevice>,
    new: Option<DeclaredDevice>,
) -> Result<Box<dyn Subresource>, DeviceError> {
    match kind {
        DeviceKind::Disk => {
            Ok(Box::new(DiskSubresource::new(old, new)?))
        }
        DeviceKind::NetworkInterface => {
            Ok(Box::new(NicSubresource::new(old, new)?))
        }
        DeviceKind::OpticalDrive => {
            Ok(Box::new(OpticalSubresource::new(old, new)?))
        }
    }
}

/// Applies each mutation to the working list, in order.
pub(crate) fn apply_all(
    list: &mut DeviceList,
    mutations: &[DeviceMutation],
) -> Result<(), DeviceError> {
    for mutation in mutations {
        list.apply(mutation)?;
    }
    Ok(())
}

