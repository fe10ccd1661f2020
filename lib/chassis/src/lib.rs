// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual device reconciliation for a machine's attached hardware.
//!
//! The engine diffs a declared device configuration (disks, network
//! interfaces, optical drives) against the live device list a hypervisor
//! reports, and produces one ordered batch of add/edit/remove mutations
//! for submission as a single transactional reconfiguration. Devices are
//! identified across sessions by their stable
//! [`DeviceAddress`](chassis_types::DeviceAddress) rather than the
//! hypervisor's volatile numeric keys; the [`registry`] guards those
//! identities against accidental reuse between passes.
//!
//! The usual flow: build [`declared::DeclaredSet`]s for the old and new
//! sides, fetch the live [`hardware::DeviceList`], then run
//! [`reconcile::reconcile`]. The outcome carries the mutation batch, the
//! updated working list, and the declared set and identity registry to
//! persist for the next pass.

pub mod allocator;
pub mod declared;
pub mod hardware;
pub mod lookup;
pub mod mutation;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod subresource;

pub use chassis_types::{
    AddressError, ControllerClass, DeviceAddress, DeviceKind,
};
pub use reconcile::{reconcile, refresh, ReconcileError, ReconcileOutcome};
