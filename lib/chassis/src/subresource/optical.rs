// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Optical drive lifecycle.
//!
//! Optical drives attach to IDE or SATA controllers only. Swapping the
//! backing (a datastore ISO or the client's passthrough device) edits in
//! place; moving between controller classes recreates the drive.

use chassis_types::{ControllerClass, DeviceAddress, DeviceKind};
use slog::debug;

use crate::allocator::allocate;
use crate::declared::{DeclaredAttributes, DeclaredDevice, OpticalAttributes};
use crate::hardware::{DeviceList, OpticalBacking, OpticalDrive, VirtualDevice};
use crate::lookup;
use crate::mutation::DeviceMutation;
use crate::subresource::{
    apply_all, DeviceError, Subresource, SubresourceCtx,
};

pub struct OpticalSubresource {
    index: u32,
    old: Option<OpticalState>,
    new: Option<OpticalState>,
}

struct OpticalState {
    attrs: OpticalAttributes,
    address: Option<DeviceAddress>,
}

impl TryFrom<DeclaredDevice> for OpticalState {
    type Error = DeviceError;

    fn try_from(device: DeclaredDevice) -> Result<Self, Self::Error> {
        match device.attributes {
            DeclaredAttributes::Optical(attrs) => {
                Ok(Self { attrs, address: device.address })
            }
            _ => Err(DeviceError::AttributeKindMismatch {
                expected: DeviceKind::OpticalDrive,
            }),
        }
    }
}

impl OpticalSubresource {
    pub fn new(
        old: Option<DeclaredDevice>,
        new: Option<DeclaredDevice>,
    ) -> Result<Self, DeviceError> {
        let index = old
            .as_ref()
            .or(new.as_ref())
            .map(|d| d.index)
            .ok_or(DeviceError::Undeclared("old or new"))?;

        Ok(Self {
            index,
            old: old.map(OpticalState::try_from).transpose()?,
            new: new.map(OpticalState::try_from).transpose()?,
        })
    }

    fn live_drive(
        list: &DeviceList,
        address: &DeviceAddress,
    ) -> Result<OpticalDrive, DeviceError> {
        match lookup::find(list, address)? {
            VirtualDevice::Optical(o) => Ok(o.clone()),
            _ => Err(DeviceError::WrongDeviceKind {
                address: *address,
                expected: DeviceKind::OpticalDrive,
            }),
        }
    }

    fn build(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let new = self.new.as_mut().ok_or(DeviceError::Undeclared("new"))?;
        let class = new.attrs.controller_class;
        if !matches!(class, ControllerClass::Ide | ControllerClass::Sata) {
            return Err(DeviceError::InvalidControllerClass {
                kind: DeviceKind::OpticalDrive,
                class,
            });
        }

        if let OpticalBacking::DatastoreIso { datastore, .. } =
            &new.attrs.backing
        {
            // Existence check only; the path already names the store.
            ctx.datastores.datastore(*datastore)?;
        }

        let placement = allocate(list, class)?;
        let key = list.reserve_key();
        let drive = OpticalDrive {
            key,
            controller_key: placement.controller_key,
            unit_number: placement.address.unit(),
            backing: new.attrs.backing.clone(),
        };
        new.address = Some(placement.address);

        let mut mutations = placement.pending;
        mutations.push(DeviceMutation::add(VirtualDevice::Optical(drive)));
        apply_all(list, &mutations)?;
        Ok(mutations)
    }
}

impl Subresource for OpticalSubresource {
    fn create(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let mutations = self.build(ctx, list)?;
        debug!(ctx.log, "created optical drive";
            "index" => self.index,
        );
        Ok(mutations)
    }

    fn read(&mut self, list: &DeviceList) -> Result<(), DeviceError> {
        let new = self.new.as_mut().ok_or(DeviceError::Undeclared("new"))?;
        let address = new.address.ok_or(DeviceError::Unplaced)?;
        let live = Self::live_drive(list, &address)?;

        new.attrs.controller_class = address.class();
        new.attrs.backing = live.backing;
        Ok(())
    }

    fn update(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let old = self.old.as_ref().ok_or(DeviceError::Undeclared("old"))?;
        let new = self.new.as_ref().ok_or(DeviceError::Undeclared("new"))?;
        let address =
            new.address.or(old.address).ok_or(DeviceError::Unplaced)?;
        let live = Self::live_drive(list, &address)?;

        if new.attrs.controller_class != old.attrs.controller_class {
            let remove =
                DeviceMutation::remove(VirtualDevice::Optical(live.clone()));
            list.apply(&remove)?;

            let mut mutations = vec![remove];
            mutations.extend(self.build(ctx, list)?);
            debug!(ctx.log, "recreated optical drive";
                "index" => self.index,
            );
            return Ok(mutations);
        }

        if let OpticalBacking::DatastoreIso { datastore, .. } =
            &new.attrs.backing
        {
            ctx.datastores.datastore(*datastore)?;
        }

        let mut edited = live.clone();
        edited.backing = new.attrs.backing.clone();
        if edited == live {
            return Ok(Vec::new());
        }

        let mutations =
            vec![DeviceMutation::edit(VirtualDevice::Optical(edited))];
        apply_all(list, &mutations)?;

        debug!(ctx.log, "edited optical drive";
            "index" => self.index,
            "address" => %address,
        );
        Ok(mutations)
    }

    fn delete(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let old = self.old.as_ref().ok_or(DeviceError::Undeclared("old"))?;
        let address = old.address.ok_or(DeviceError::Unplaced)?;
        let live = Self::live_drive(list, &address)?;

        let remove = DeviceMutation::remove(VirtualDevice::Optical(live));
        list.apply(&remove)?;

        debug!(ctx.log, "removed optical drive";
            "index" => self.index,
            "address" => %address,
        );
        Ok(vec![remove])
    }

    fn into_declared(self: Box<Self>) -> Option<DeclaredDevice> {
        let index = self.index;
        self.new.map(|state| DeclaredDevice {
            index,
            address: state.address,
            attributes: DeclaredAttributes::Optical(state.attrs),
        })
    }
}
