// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network interface lifecycle.
//!
//! NICs always attach to the PCI controller. The emulated adapter type is
//! guest-visible hardware and cannot change in place; everything else
//! (MAC policy, bandwidth shares, the connected network) edits in place.

use chassis_types::{ControllerClass, DeviceAddress, DeviceKind};
use slog::debug;

use crate::allocator::allocate;
use crate::declared::{DeclaredAttributes, DeclaredDevice, NicAttributes};
use crate::hardware::{DeviceList, MacPolicy, NetworkInterface, VirtualDevice};
use crate::lookup;
use crate::mutation::DeviceMutation;
use crate::subresource::{
    apply_all, DeviceError, Subresource, SubresourceCtx,
};

pub struct NicSubresource {
    index: u32,
    old: Option<NicState>,
    new: Option<NicState>,
}

struct NicState {
    attrs: NicAttributes,
    address: Option<DeviceAddress>,
}

impl TryFrom<DeclaredDevice> for NicState {
    type Error = DeviceError;

    fn try_from(device: DeclaredDevice) -> Result<Self, Self::Error> {
        match device.attributes {
            DeclaredAttributes::Nic(attrs) => {
                Ok(Self { attrs, address: device.address })
            }
            _ => Err(DeviceError::AttributeKindMismatch {
                expected: DeviceKind::NetworkInterface,
            }),
        }
    }
}

impl NicSubresource {
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
            old: old.map(NicState::try_from).transpose()?,
            new: new.map(NicState::try_from).transpose()?,
        })
    }

    fn live_nic(
        list: &DeviceList,
        address: &DeviceAddress,
    ) -> Result<NetworkInterface, DeviceError> {
        match lookup::find(list, address)? {
            VirtualDevice::Nic(n) => Ok(n.clone()),
            _ => Err(DeviceError::WrongDeviceKind {
                address: *address,
                expected: DeviceKind::NetworkInterface,
            }),
        }
    }

    fn build(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let new = self.new.as_mut().ok_or(DeviceError::Undeclared("new"))?;
        check_mac(&new.attrs.mac)?;

        let placement = allocate(list, ControllerClass::Pci)?;
        let network = ctx.networks.network(new.attrs.network)?;
        let key = list.reserve_key();

        let nic = NetworkInterface {
            key,
            controller_key: placement.controller_key,
            unit_number: placement.address.unit(),
            adapter: new.attrs.adapter,
            mac: new.attrs.mac.clone(),
            bandwidth: new.attrs.bandwidth,
            network: network.id,
        };
        new.address = Some(placement.address);

        let mut mutations = placement.pending;
        mutations.push(DeviceMutation::add(VirtualDevice::Nic(nic)));
        apply_all(list, &mutations)?;
        Ok(mutations)
    }
}

impl Subresource for NicSubresource {
    fn create(
        &mut self,
        ctx: &SubresourceCtx<'_>,
        list: &mut DeviceList,
    ) -> Result<Vec<DeviceMutation>, DeviceError> {
        let mutations = self.build(ctx, list)?;
        debug!(ctx.log, "created network interface";
            "index" => self.index,
        );
        Ok(mutations)
    }

    fn read(&mut self, list: &DeviceList) -> Result<(), DeviceError> {
        let new = self.new.as_mut().ok_or(DeviceError::Undeclared("new"))?;
        let address = new.address.ok_or(DeviceError::Unplaced)?;
        let live = Self::live_nic(list, &address)?;

        new.attrs.adapter = live.adapter;
        new.attrs.mac = live.mac;
        new.attrs.bandwidth = live.bandwidth;
        new.attrs.network = live.network;
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
        let live = Self::live_nic(list, &address)?;

        if new.attrs.adapter != old.attrs.adapter {
            // Guest-visible hardware change: detach and reattach.
            let remove =
                DeviceMutation::remove(VirtualDevice::Nic(live.clone()));
            list.apply(&remove)?;

            let mut mutations = vec![remove];
            mutations.extend(self.build(ctx, list)?);
            debug!(ctx.log, "recreated network interface";
                "index" => self.index,
            );
            return Ok(mutations);
        }

        check_mac(&new.attrs.mac)?;
        let network = ctx.networks.network(new.attrs.network)?;

        let mut edited = live.clone();
        edited.mac = new.attrs.mac.clone();
        edited.bandwidth = new.attrs.bandwidth;
        edited.network = network.id;
        if edited == live {
            return Ok(Vec::new());
        }

        let mutations = vec![DeviceMutation::edit(VirtualDevice::Nic(edited))];
        apply_all(list, &mutations)?;

        debug!(ctx.log, "edited network interface";
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
        let live = Self::live_nic(list, &address)?;

        let remove = DeviceMutation::remove(VirtualDevice::Nic(live));
        list.apply(&remove)?;

        debug!(ctx.log, "removed network interface";
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
            attributes: DeclaredAttributes::Nic(state.attrs),
        })
    }
}

/// A manually assigned MAC must be six colon-separated hex octets.
fn check_mac(mac: &MacPolicy) -> Result<(), DeviceError> {
    let MacPolicy::Manual { address } = mac else {
        return Ok(());
    };

    let octets: Vec<&str> = address.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && u8::from_str_radix(o, 16).is_ok());

    if valid {
        Ok(())
    } else {
        Err(DeviceError::InvalidMacAddress(address.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hardware::{AdapterType, Controller, ShareAllocation};
    use crate::mutation::MutationOp;
    use crate::resolver::StaticCatalog;
    use slog::o;
    use std::str::FromStr;
    use uuid::Uuid;

    const NET: Uuid = Uuid::from_u128(7);

    fn catalog() -> StaticCatalog {
        StaticCatalog::new().with_network(NET, "guest-net")
    }

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn attrs() -> NicAttributes {
        NicAttributes {
            adapter: AdapterType::Vmxnet3,
            mac: MacPolicy::Generated,
            bandwidth: ShareAllocation::Normal,
            network: NET,
        }
    }

    fn declared(
        index: u32,
        address: Option<&str>,
        attrs: NicAttributes,
    ) -> DeclaredDevice {
        DeclaredDevice {
            index,
            address: address.map(|a| DeviceAddress::from_str(a).unwrap()),
            attributes: DeclaredAttributes::Nic(attrs),
        }
    }

    fn live_list() -> DeviceList {
        let mut list = DeviceList::new(vec![VirtualDevice::Controller(
            Controller {
                key: 100,
                class: ControllerClass::Pci,
                bus_number: 0,
            },
        )]);
        list.apply(&DeviceMutation::add(VirtualDevice::Nic(
            NetworkInterface {
                key: 4000,
                controller_key: 100,
                unit_number: 0,
                adapter: AdapterType::Vmxnet3,
                mac: MacPolicy::Generated,
                bandwidth: ShareAllocation::Normal,
                network: NET,
            },
        )))
        .unwrap();
        list
    }

    #[test]
    fn create_places_on_pci() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut sub =
            NicSubresource::new(None, Some(declared(1, None, attrs())))
                .unwrap();
        let mutations = sub.create(&ctx, &mut list).unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].op, MutationOp::Add);

        let done = Box::new(sub).into_declared().unwrap();
        assert_eq!(done.address.unwrap().to_string(), "pci:0:1");
    }

    #[test]
    fn bad_manual_mac_rejected() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = DeviceList::default();

        let mut wanted = attrs();
        wanted.mac =
            MacPolicy::Manual { address: "not-a-mac".to_owned() };
        let mut sub =
            NicSubresource::new(None, Some(declared(0, None, wanted)))
                .unwrap();

        let err = sub.create(&ctx, &mut list).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidMacAddress(_)));
        assert!(list.is_empty());
    }

    #[test]
    fn bandwidth_and_mac_edit_in_place() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut wanted = attrs();
        wanted.mac =
            MacPolicy::Manual { address: "00:a0:98:12:34:56".to_owned() };
        wanted.bandwidth = ShareAllocation::Custom(75);
        let mut sub = NicSubresource::new(
            Some(declared(0, Some("pci:0:0"), attrs())),
            Some(declared(0, Some("pci:0:0"), wanted)),
        )
        .unwrap();

        let mutations = sub.update(&ctx, &mut list).unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].op, MutationOp::Edit);
        match list.entry(4000).unwrap() {
            VirtualDevice::Nic(n) => {
                assert_eq!(n.bandwidth, ShareAllocation::Custom(75));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn adapter_change_recreates() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut wanted = attrs();
        wanted.adapter = AdapterType::E1000;
        let mut sub = NicSubresource::new(
            Some(declared(0, Some("pci:0:0"), attrs())),
            Some(declared(0, Some("pci:0:0"), wanted)),
        )
        .unwrap();

        let mutations = sub.update(&ctx, &mut list).unwrap();
        assert_eq!(mutations.len(), 2);
        assert_eq!(mutations[0].op, MutationOp::Remove);
        assert_eq!(mutations[1].op, MutationOp::Add);

        // The slot freed by the remove is taken by the replacement.
        let done = Box::new(sub).into_declared().unwrap();
        assert_eq!(done.address.unwrap().to_string(), "pci:0:0");
        match list.entry(mutations[1].device.key()).unwrap() {
            VirtualDevice::Nic(n) => {
                assert_eq!(n.adapter, AdapterType::E1000);
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn unchanged_update_produces_nothing() {
        let catalog = catalog();
        let log = test_log();
        let ctx = SubresourceCtx::new(&log, "vm", &catalog, &catalog);
        let mut list = live_list();

        let mut sub = NicSubresource::new(
            Some(declared(0, Some("pci:0:0"), attrs())),
            Some(declared(0, Some("pci:0:0"), attrs())),
        )
        .unwrap();

        assert!(sub.update(&ctx, &mut list).unwrap().is_empty());
    }
}
