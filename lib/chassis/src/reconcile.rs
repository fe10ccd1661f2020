// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reconciliation driver.
//!
//! One pass takes the declared old and new device sets, the live device
//! list, and the identity registry, and produces the updated working list,
//! the ordered mutation batch for the hypervisor, the updated declared
//! set (with freshly assigned addresses), and the rebuilt registry.
//!
//! Operations run deletes first, then creates, then updates: deletes free
//! controller slots that creates may need, and updates run against the
//! final set of controllers rather than stale mid-pass state. Every
//! mutation is applied to the working list as it is produced, so each
//! step sees the effects of the ones before it. Any error abandons the
//! pass; nothing has been submitted to the hypervisor at that point, and
//! the caller discards the working state and re-fetches.

use std::collections::BTreeSet;

use chassis_types::DeviceKind;
use slog::{debug, info, o};
use thiserror::Error;

use crate::declared::{DeclaredError, DeclaredSet};
use crate::hardware::DeviceList;
use crate::mutation::DeviceMutation;
use crate::registry::{IdentityRegistry, RegistryError};
use crate::subresource::{
    subresource_for, DeviceError, SubresourceCtx,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{kind} {index}: {source}")]
    Device {
        kind: DeviceKind,
        index: u32,
        #[source]
        source: DeviceError,
    },

    #[error(transparent)]
    Declared(#[from] DeclaredError),
}

/// Everything a successful pass yields. The mutation list is the wire
/// contract for one transactional reconfiguration call; the declared set
/// and registry go back into the caller's persisted state.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub device_list: DeviceList,
    pub mutations: Vec<DeviceMutation>,
    pub declared: DeclaredSet,
    pub registry: IdentityRegistry,
}

/// Runs one reconciliation pass.
pub fn reconcile(
    old: &DeclaredSet,
    new: &DeclaredSet,
    device_list: DeviceList,
    registry: &IdentityRegistry,
    ctx: &SubresourceCtx<'_>,
) -> Result<ReconcileOutcome, ReconcileError> {
    let log = ctx.log.new(o!("component" => "reconcile"));

    registry.validate(new)?;

    let old_keys: BTreeSet<(DeviceKind, u32)> = old.keys().collect();
    let new_keys: BTreeSet<(DeviceKind, u32)> = new.keys().collect();

    let mut list = device_list;
    let mut removes = Vec::new();
    let mut adds = Vec::new();
    let mut edits = Vec::new();
    let mut out = DeclaredSet::new();

    let annotate = |kind: DeviceKind, index: u32| {
        move |source: DeviceError| ReconcileError::Device {
            kind,
            index,
            source,
        }
    };

    for &(kind, index) in old_keys.difference(&new_keys) {
        debug!(log, "deleting device"; "kind" => %kind, "index" => index);
        let mut sub =
            subresource_for(kind, old.get(kind, index).cloned(), None)
                .map_err(annotate(kind, index))?;
        removes.extend(
            sub.delete(ctx, &mut list).map_err(annotate(kind, index))?,
        );
    }

    for &(kind, index) in new_keys.difference(&old_keys) {
        debug!(log, "creating device"; "kind" => %kind, "index" => index);
        let mut sub =
            subresource_for(kind, None, new.get(kind, index).cloned())
                .map_err(annotate(kind, index))?;
        adds.extend(
            sub.create(ctx, &mut list).map_err(annotate(kind, index))?,
        );
        if let Some(done) = sub.into_declared() {
            out.insert(done)?;
        }
    }

    for &(kind, index) in old_keys.intersection(&new_keys) {
        let old_entry = old.get(kind, index);
        let new_entry = new.get(kind, index);
        let (Some(old_entry), Some(new_entry)) = (old_entry, new_entry)
        else {
            continue;
        };

        if old_entry.attributes == new_entry.attributes {
            out.insert(new_entry.clone())?;
            continue;
        }

        debug!(log, "updating device"; "kind" => %kind, "index" => index);
        let mut sub = subresource_for(
            kind,
            Some(old_entry.clone()),
            Some(new_entry.clone()),
        )
        .map_err(annotate(kind, index))?;
        edits.extend(
            sub.update(ctx, &mut list).map_err(annotate(kind, index))?,
        );
        if let Some(done) = sub.into_declared() {
            out.insert(done)?;
        }
    }

    let mut mutations = removes;
    mutations.extend(adds);
    mutations.extend(edits);

    info!(log, "reconciled devices";
        "declared" => new.len(),
        "mutations" => mutations.len(),
        "devices" => list.len(),
    );

    let registry = IdentityRegistry::rebuild(&out);
    Ok(ReconcileOutcome {
        device_list: list,
        mutations,
        declared: out,
        registry,
    })
}

/// Reads every declared device's observed attributes out of the live
/// list, yielding the refreshed declared set. Used for drift detection
/// and import; touches nothing.
pub fn refresh(
    declared: &DeclaredSet,
    list: &DeviceList,
) -> Result<DeclaredSet, ReconcileError> {
    let mut out = DeclaredSet::new();
    for device in declared.iter() {
        let kind = device.kind();
        let index = device.index;
        let mut sub = subresource_for(kind, None, Some(device.clone()))
            .map_err(|source| ReconcileError::Device {
                kind,
                index,
                source,
            })?;
        sub.read(list).map_err(|source| ReconcileError::Device {
            kind,
            index,
            source,
        })?;
        if let Some(done) = sub.into_declared() {
            out.insert(done)?;
        }
    }
    Ok(out)
}
