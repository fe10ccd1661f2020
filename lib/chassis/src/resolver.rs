// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External object resolvers.
//!
//! Disk and NIC construction needs to turn a declared datastore or network
//! id into a reference with a usable name. Those lookups belong to the
//! surrounding service; the engine sees them through these traits as
//! opaque blocking calls. Deadlines are the caller's concern.

use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("datastore {0} not found")]
    DatastoreNotFound(Uuid),

    #[error("network {0} not found")]
    NetworkNotFound(Uuid),
}

/// A resolved datastore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatastoreRef {
    pub id: Uuid,
    pub name: String,
}

/// A resolved guest network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkRef {
    pub id: Uuid,
    pub name: String,
}

pub trait DatastoreResolver {
    fn datastore(&self, id: Uuid) -> Result<DatastoreRef, ResolveError>;
}

pub trait NetworkResolver {
    fn network(&self, id: Uuid) -> Result<NetworkRef, ResolveError>;
}

/// An in-memory catalog of datastores and networks. Suitable for tests and
/// for callers that pre-fetch their inventory.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    datastores: Vec<DatastoreRef>,
    networks: Vec<NetworkRef>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datastore(mut self, id: Uuid, name: &str) -> Self {
        self.datastores.push(DatastoreRef { id, name: name.to_owned() });
        self
    }

    pub fn with_network(mut self, id: Uuid, name: &str) -> Self {
        self.networks.push(NetworkRef { id, name: name.to_owned() });
        self
    }
}

impl DatastoreResolver for StaticCatalog {
    fn datastore(&self, id: Uuid) -> Result<DatastoreRef, ResolveError> {
        self.datastores
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(ResolveError::DatastoreNotFound(id))
    }
}

impl NetworkResolver for StaticCatalog {
    fn network(&self, id: Uuid) -> Result<NetworkRef, ResolveError> {
        self.networks
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or(ResolveError::NetworkNotFound(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn catalog_lookups() {
        let catalog = StaticCatalog::new()
            .with_datastore(Uuid::from_u128(1), "store1")
            .with_network(Uuid::from_u128(2), "guest-net");

        assert_eq!(
            catalog.datastore(Uuid::from_u128(1)).unwrap().name,
            "store1"
        );
        assert_eq!(
            catalog.network(Uuid::from_u128(2)).unwrap().name,
            "guest-net"
        );
        assert_eq!(
            catalog.datastore(Uuid::from_u128(9)),
            Err(ResolveError::DatastoreNotFound(Uuid::from_u128(9)))
        );
    }
}
