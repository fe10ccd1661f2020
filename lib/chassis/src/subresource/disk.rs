// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk lifecycle.
//!
//! Attribute handling on update:
//! - capacity growth and the write-through flag edit in place;
//! - a controller class change moves the disk: detach and reattach at a
//!   fresh address, keeping the backing file;
//! - a provisioning change rebuilds the backing, so the old file is
//!   destroyed (unless kept) and a new one created;
//! - the datastore and an explicitly declared backing path can never
//!   change, and a disk can never shrink.

use chassis_types::{DeviceAddress, DeviceKind};
use slog::debug;

use crate::allocator::allocate;
use crate::declared::{DeclaredAttributes, DeclaredDevice, DiskAttributes};
use crate::hardware::{Disk, DiskBacking, DeviceList, VirtualDevice};
use crate::lookup;
use crate::mutation::{DeviceMutation, FileOperation};
use crate::subresource::{
    apply_all, DeviceError, Subresource, SubresourceCtx,
};

pub struct DiskSubresource {
    index: u32,
    old: Option<DiskState>,
    new: Option<DiskState>,
}

struct DiskState {
    attrs: DiskAttributes,
    address: Option<DeviceAddress>,
}

impl TryFrom<DeclaredDevice> for DiskState {
    type Error = DeviceError;

    fn try_from(device: DeclaredDevice) -> Result<Self, Self::Error> {
        match device.attributes {
            DeclaredAttributes::Disk(attrs) => {
                Ok(Self { attrs, address: device.address })
            }
            _ => Err(DeviceError::AttributeKindMismatch {
                expected: DeviceKind::Disk,
            }),
        }
    }
}

impl DiskSubresource {
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
            old: old.map(DiskState::try_from).transpose()?,
            new: new.map(DiskState::try_from).transpose()?,
        })
    }

    fn live_disk(
        list: &DeviceList,
        address: &DeviceAddress,
    ) -> Result<Disk, DeviceError> {
        match lookup::find(list, address)? {
            VirtualDevice::Disk(d) => Ok(d.clone()),
            _ => Err(DeviceError::WrongDeviceKind {
                address: *address,
                expected: DeviceKind::Disk,
            }),
        }
    }

    /// Detach and reattach at a fresh address, keeping the backing file.
    fn relocate(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
        live: &Disk,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let remove = DeviceMutation::remove(VirtualDevice::Disk(live.clone()));
        list.apply(&remove)?;

        let new = self.new.as_mut().ok_or(DeviceError::Undeclared("new"))?;
        let placement = allocate(list, new.attrs.controller_class)?;
        apply_all(list, &placement.pending)?;

        let key = list.reserve_key();
        let disk = Disk {
            key,
            controller_key: placement.controller_key,
            unit_number: placement.address.unit(),
            capacity_kib: new.attrs.capacity_kib,
            provisioning: new.attrs.provisioning,
            backing: DiskBacking {
                file_path: live.backing.file_path.clone(),
                datastore: live.backing.datastore,
                write_through: new.attrs.write_through,
            },
        };
        new.address = Some(placement.address);

        let add = DeviceMutation::add(VirtualDevice::Disk(disk));
        list.apply(&add)?;

        debug!(ctx.log, "relocated disk";
            "index" => self.index,
            "address" => %placement.address,
        );

        let mut mutations = vec![remove];
        mutations.extend(placement.pending);
        mutations.push(add);
        Ok(mutations)
    }

    /// Destroy the old backing (unless kept) and create a fresh one under
    /// the new provisioning mode.
    fn rebuild(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
        live: &Disk,
        keep_backing: bool,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let mut remove =
            DeviceMutation::remove(VirtualDevice::Disk(live.clone()));
        if !keep_backing {
            remove = remove.with_file_op(FileOperation::Destroy);
        }
        list.apply(&remove)?;

        let index = self.index;
        let vm_name = ctx.vm_name;
        let new = self.new.as_mut().ok_or(DeviceError::Undeclared("new"))?;
        let placement = allocate(list, new.attrs.controller_class)?;
        apply_all(list, &placement.pending)?;

        let datastore = ctx.datastores.datastore(new.attrs.datastore)?;
        let key = list.reserve_key();
        let disk = Disk {
            key,
            controller_key: placement.controller_key,
            unit_number: placement.address.unit(),
            capacity_kib: new.attrs.capacity_kib,
            provisioning: new.attrs.provisioning,
            backing: DiskBacking {
                file_path: generated_path(&datastore.name, vm_name, index),
                datastore: datastore.id,
                write_through: new.attrs.write_through,
            },
        };
        new.address = Some(placement.address);

        let add = DeviceMutation::add(VirtualDevice::Disk(disk))
            .with_file_op(FileOperation::Create);
        list.apply(&add)?;

        debug!(ctx.log, "rebuilt disk backing";
            "index" => index,
            "address" => %placement.address,
        );

        let mut mutations = vec![remove];
        mutations.extend(placement.pending);
        mutations.push(add);
        Ok(mutations)
    }
}

impl Subresource for DiskSubresource {
    fn create(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let index = self.index;
        let vm_name = ctx.vm_name;
        let new = self.new.as_mut().ok_or(DeviceError::Undeclared("new"))?;

        let placement = allocate(list, new.attrs.controller_class)?;
        let datastore = ctx.datastores.datastore(new.attrs.datastore)?;
        let key = list.reserve_key();

        let (file_path, file_op) = match &new.attrs.backing_path {
            Some(path) => (path.clone(), None),
            None => (
                generated_path(&datastore.name, vm_name, index),
                Some(FileOperation::Create),
            ),
        };

        let disk = Disk {
            key,
            controller_key: placement.controller_key,
            unit_number: placement.address.unit(),
            capacity_kib: new.attrs.capacity_kib,
            provisioning: new.attrs.provisioning,
            backing: DiskBacking {
                file_path,
                datastore: datastore.id,
                write_through: new.attrs.write_through,
            },
        };
        new.address = Some(placement.address);

        let mut add = DeviceMutation::add(VirtualDevice::Disk(disk));
        if let Some(op) = file_op {
            add = add.with_file_op(op);
        }

        let mut mutations = placement.pending;
        mutations.push(add);
        apply_all(list, &mutations)?;

        debug!(ctx.log, "created disk";
            "index" => index,
            "address" => %placement.address,
        );
        Ok(mutations)
    }

    fn read(&mut self, list: &DeviceList) -> Result<(), DeviceError> {
        let new = self.new.as_mut().ok_or(DeviceError::Undeclared("new"))?;
        let address = new.address.ok_or(DeviceError::Unplaced)?;
        let live = Self::live_disk(list, &address)?;

        new.attrs.capacity_kib = live.capacity_kib;
        new.attrs.provisioning = live.provisioning;
        new.attrs.backing_path = Some(live.backing.file_path);
        new.attrs.datastore = live.backing.datastore;
        new.attrs.write_through = live.backing.write_through;
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
        let live = Self::live_disk(list, &address)?;

        if new.attrs.datastore != old.attrs.datastore {
            return Err(DeviceError::ForbiddenChange {
                attribute: "datastore",
            });
        }
        if let (Some(o), Some(n)) =
            (&old.attrs.backing_path, &new.attrs.backing_path)
        {
            if o != n {
                return Err(DeviceError::ForbiddenChange {
                    attribute: "backing_path",
                });
            }
        }
        if new.attrs.capacity_kib < live.capacity_kib {
            return Err(DeviceError::ShrinkNotAllowed {
                declared: new.attrs.capacity_kib,
                current: live.capacity_kib,
            });
        }

        if new.attrs.controller_class != old.attrs.controller_class {
            return self.relocate(ctx, list, &live);
        }
        if new.attrs.provisioning != old.attrs.provisioning {
            let keep = old.attrs.keep_backing_on_remove;
            return self.rebuild(ctx, list, &live, keep);
        }

        let mut edited = live.clone();
        edited.capacity_kib = new.attrs.capacity_kib;
        edited.backing.write_through = new.attrs.write_through;
        if edited == live {
            // Only declaration-side attributes changed; nothing to submit.
            return Ok(Vec::new());
        }

        let mutations =
            vec![DeviceMutation::edit(VirtualDevice::Disk(edited))];
        apply_all(list, &mutations)?;

        debug!(ctx.log, "edited disk";
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
        let live = Self::live_disk(list, &address)?;

        let mut remove = DeviceMutation::remove(VirtualDevice::Disk(live));
        if !old.attrs.keep_backing_on_remove {
            remove = remove.with_file_op(FileOperation::Destroy);
        }
        list.apply(&remove)?;

        debug!(ctx.log, "removed disk";
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
            attributes: DeclaredAttributes::Disk(state.attrs),
        })
    }
}

fn generated_path(datastore_name: &str, vm_name: &str, index: u32) -> String {
    format!("[{datastore_name}] {vm_name}/{vm_name}-disk{index}.vmdk")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hardware::{Controller, DiskProvisioning};
    use crate::mutation::MutationOp;
    use crate::resolver::StaticCatalog;
    use chassis_types::ControllerClass;
    use slog::o;
    use std::str::FromStr;
    use uuid::Uuid;

    const STORE: Uuid = Uuid::from_u128(1);

    fn catalog() -> StaticCatalog {
        StaticCatalog::new().with_datastore(STORE, "store1")
    }

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn attrs() -> DiskAttributes {
        DiskAttributes {
            controller_class: ControllerClass::Scsi,
            capacity_kib: 1 << 20,
            provisioning: DiskProvisioning::Thin,
            backing_path: None,
            datastore: STORE,
            write_through: false,
            keep_backing_on_remove: false,
        }
    }

    fn declared(
        index: u32,
        address: Option<&str>,
        attrs: DiskAttributes,
    ) -> DeclaredDevice {
        DeclaredDevice {
            index,
            address: address.map(|a| DeviceAddress::from_str(a).unwrap()),
            attributes: DeclaredAttributes::Disk(attrs),
        }
    }

    fn live_list() -> DeviceList {
        let mut list = DeviceList::new(vec![VirtualDevice::Controller(
            Controller {
                key: 1000,
                class: ControllerClass::Scsi,
                bus_number: 0,
            },
        )]);
        list.apply(&DeviceMutation::add(VirtualDevice::Disk(Disk {
            key: 2000,
            controller_key: 1000,
            unit_number: 0,
            capacity_kib: 1 << 20,
            provisioning: DiskProvisioning::Thin,
            backing: DiskBacking {
                file_path: "[store1] vm/vm-disk0.vmdk".to_owned(),
                datastore: STORE,
                write_through: false,
            },
        })))
        .unwrap();
        list
    }

    #[test]
    fn create_on_empty_list_adds_controller_and_backing() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = DeviceList::default();

        let mut sub =
            DiskSubresource::new(None, Some(declared(0, None, attrs())))
                .unwrap();
        let mutations = sub.create(&ctx, &mut list).unwrap();

        assert_eq!(mutations.len(), 2);
        assert!(matches!(
            mutations[0].device,
            VirtualDevice::Controller(_)
        ));
        assert_eq!(mutations[1].op, MutationOp::Add);
        assert_eq!(mutations[1].file_op, Some(FileOperation::Create));
        assert_eq!(list.len(), 2);

        let done = Box::new(sub).into_declared().unwrap();
        assert_eq!(done.address.unwrap().to_string(), "scsi:0:0");
        match done.attributes {
            DeclaredAttributes::Disk(a) => {
                assert_eq!(a.backing_path, None);
            }
            other => panic!("unexpected attributes {other:?}"),
        }
    }

    #[test]
    fn create_attaching_existing_backing_skips_file_op() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut wanted = attrs();
        wanted.backing_path = Some("[store1] vm/extra.vmdk".to_owned());
        let mut sub =
            DiskSubresource::new(None, Some(declared(1, None, wanted)))
                .unwrap();
        let mutations = sub.create(&ctx, &mut list).unwrap();

        // The existing controller has room; no controller add.
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].file_op, None);
        let done = Box::new(sub).into_declared().unwrap();
        assert_eq!(done.address.unwrap().to_string(), "scsi:0:1");
    }

    #[test]
    fn read_imports_live_attributes() {
        let list = live_list();
        let mut wanted = attrs();
        wanted.capacity_kib = 0;
        let mut sub = DiskSubresource::new(
            None,
            Some(declared(0, Some("scsi:0:0"), wanted)),
        )
        .unwrap();

        sub.read(&list).unwrap();
        let done = Box::new(sub).into_declared().unwrap();
        match done.attributes {
            DeclaredAttributes::Disk(a) => {
                assert_eq!(a.capacity_kib, 1 << 20);
                assert_eq!(
                    a.backing_path.as_deref(),
                    Some("[store1] vm/vm-disk0.vmdk")
                );
            }
            other => panic!("unexpected attributes {other:?}"),
        }
    }

    #[test]
    fn grow_is_a_single_edit() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut grown = attrs();
        grown.capacity_kib = 2 << 20;
        let mut sub = DiskSubresource::new(
            Some(declared(0, Some("scsi:0:0"), attrs())),
            Some(declared(0, Some("scsi:0:0"), grown)),
        )
        .unwrap();

        let mutations = sub.update(&ctx, &mut list).unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].op, MutationOp::Edit);
        match list.entry(2000).unwrap() {
            VirtualDevice::Disk(d) => assert_eq!(d.capacity_kib, 2 << 20),
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn shrink_is_vetoed_without_mutation() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut shrunk = attrs();
        shrunk.capacity_kib = 1 << 10;
        let mut sub = DiskSubresource::new(
            Some(declared(0, Some("scsi:0:0"), attrs())),
            Some(declared(0, Some("scsi:0:0"), shrunk)),
        )
        .unwrap();

        let before = list.clone();
        let err = sub.update(&ctx, &mut list).unwrap_err();
        assert!(matches!(err, DeviceError::ShrinkNotAllowed { .. }));
        assert_eq!(list.len(), before.len());
    }

    #[test]
    fn datastore_change_is_forbidden() {
        let catalog =
            catalog().with_datastore(Uuid::from_u128(2), "store2");
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut moved = attrs();
        moved.datastore = Uuid::from_u128(2);
        let mut sub = DiskSubresource::new(
            Some(declared(0, Some("scsi:0:0"), attrs())),
            Some(declared(0, Some("scsi:0:0"), moved)),
        )
        .unwrap();

        let err = sub.update(&ctx, &mut list).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ForbiddenChange { attribute: "datastore" }
        ));
    }

    #[test]
    fn controller_change_relocates_with_fresh_address() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut moved = attrs();
        moved.controller_class = ControllerClass::Sata;
        let mut sub = DiskSubresource::new(
            Some(declared(0, Some("scsi:0:0"), attrs())),
            Some(declared(0, Some("scsi:0:0"), moved)),
        )
        .unwrap();

        let mutations = sub.update(&ctx, &mut list).unwrap();
        // remove, sata controller add, disk add; backing carried over.
        assert_eq!(mutations.len(), 3);
        assert_eq!(mutations[0].op, MutationOp::Remove);
        assert_eq!(mutations[0].file_op, None);
        assert_eq!(mutations[2].op, MutationOp::Add);
        assert_eq!(mutations[2].file_op, None);

        let done = Box::new(sub).into_declared().unwrap();
        assert_eq!(done.address.unwrap().to_string(), "sata:0:0");
    }

    #[test]
    fn delete_honors_keep_backing() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);

        for (keep, want) in
            [(false, Some(FileOperation::Destroy)), (true, None)]
        {
            let mut list = live_list();
            let mut old = attrs();
            old.keep_backing_on_remove = keep;
            let mut sub = DiskSubresource::new(
                Some(declared(0, Some("scsi:0:0"), old)),
                None,
            )
            .unwrap();

            let mutations = sub.delete(&ctx, &mut list).unwrap();
            assert_eq!(mutations.len(), 1);
            assert_eq!(mutations[0].op, MutationOp::Remove);
            assert_eq!(mutations[0].file_op, want);
            assert_eq!(list.len(), 1);
        }
    }
}
