// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Groups hosts into cells and aggregates.
//!
//! Cells partition the cluster into (possibly nested) scheduling domains and
//! every host belongs to exactly one of them. Aggregates are named, possibly
//! overlapping groups of hosts whose metadata the scheduler matches against
//! request extra specs; an aggregate may also name an availability zone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use corral_types::{AggregateUuid, CellName, HostUuid};
use serde::Serialize;
use slog::{info, Logger};
use thiserror::Error;

use crate::inventory::ResourceInventory;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Cell {0} not found")]
    CellNotFound(CellName),

    #[error("Cell {0} already exists")]
    DuplicateCell(CellName),

    #[error("Aggregate {0} not found")]
    AggregateNotFound(String),

    #[error("An aggregate named {0:?} already exists")]
    DuplicateAggregate(String),

    #[error("Aggregate {0:?} still has hosts")]
    AggregateNotEmpty(String),

    #[error("Host {0} not found")]
    HostNotFound(HostUuid),

    #[error("Host {0} is already a member of aggregate {1:?}")]
    AlreadyMember(HostUuid, String),

    #[error("Host {0} is not a member of aggregate {1:?}")]
    NotMember(HostUuid, String),

    #[error(
        "Host {host} has pending reservations that depend on {tags:?}, which \
         only aggregate {aggregate:?} supplies"
    )]
    TagsInUse { host: HostUuid, aggregate: String, tags: Vec<String> },

    #[error("Invalid name {0:?}")]
    InvalidName(String),
}

/// A snapshot of one aggregate.
#[derive(Clone, Debug, Serialize)]
pub struct Aggregate {
    pub id: AggregateUuid,
    pub name: String,
    pub availability_zone: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub hosts: BTreeSet<HostUuid>,
}

#[derive(Clone, Debug)]
struct Cell {
    parent: Option<CellName>,
}

#[derive(Default)]
struct Inner {
    cells: BTreeMap<CellName, Cell>,
    host_cells: BTreeMap<HostUuid, CellName>,
    aggregates: BTreeMap<AggregateUuid, Aggregate>,
}

impl Inner {
    fn aggregate_mut(
        &mut self,
        id: AggregateUuid,
    ) -> Result<&mut Aggregate, DirectoryError> {
        self.aggregates
            .get_mut(&id)
            .ok_or_else(|| DirectoryError::AggregateNotFound(id.to_string()))
    }
}

pub struct Directory {
    inner: RwLock<Inner>,
    default_availability_zone: String,
    log: Logger,
}

impl Directory {
    pub fn new(default_availability_zone: String, log: Logger) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            default_availability_zone,
            log,
        }
    }

    pub fn default_availability_zone(&self) -> &str {
        &self.default_availability_zone
    }

    pub fn create_cell(
        &self,
        name: CellName,
        parent: Option<CellName>,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write().unwrap();
        if inner.cells.contains_key(&name) {
            return Err(DirectoryError::DuplicateCell(name));
        }
        if let Some(parent) = &parent {
            if !inner.cells.contains_key(parent) {
                return Err(DirectoryError::CellNotFound(parent.clone()));
            }
        }
        info!(self.log, "created cell"; "cell" => %name, "parent" => ?parent);
        inner.cells.insert(name, Cell { parent });
        Ok(())
    }

    pub fn cells(&self) -> Vec<(CellName, Option<CellName>)> {
        self.inner
            .read()
            .unwrap()
            .cells
            .iter()
            .map(|(name, cell)| (name.clone(), cell.parent.clone()))
            .collect()
    }

    /// Places `host` in `cell`, moving it out of any cell it was in before.
    pub fn assign_host(
        &self,
        host: HostUuid,
        cell: CellName,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.cells.contains_key(&cell) {
            return Err(DirectoryError::CellNotFound(cell));
        }
        inner.host_cells.insert(host, cell);
        Ok(())
    }

    pub fn cell_of(&self, host: HostUuid) -> Option<CellName> {
        self.inner.read().unwrap().host_cells.get(&host).cloned()
    }

    /// Returns true if `cell` is `ancestor` or one of its descendants.
    pub fn cell_within(&self, cell: &CellName, ancestor: &CellName) -> bool {
        let inner = self.inner.read().unwrap();
        let mut cursor = Some(cell.clone());
        while let Some(current) = cursor {
            if &current == ancestor {
                return true;
            }
            cursor = inner.cells.get(&current).and_then(|c| c.parent.clone());
        }
        false
    }

    pub fn hosts_in_cell(
        &self,
        cell: &CellName,
        include_children: bool,
    ) -> Result<Vec<HostUuid>, DirectoryError> {
        if !self.inner.read().unwrap().cells.contains_key(cell) {
            return Err(DirectoryError::CellNotFound(cell.clone()));
        }
        let host_cells = self.inner.read().unwrap().host_cells.clone();
        Ok(host_cells
            .into_iter()
            .filter(|(_, c)| {
                c == cell || (include_children && self.cell_within(c, cell))
            })
            .map(|(h, _)| h)
            .collect())
    }

    /// Forgets everything the directory knows about `host`.
    pub fn forget_host(&self, host: HostUuid) {
        let mut inner = self.inner.write().unwrap();
        inner.host_cells.remove(&host);
        for agg in inner.aggregates.values_mut() {
            agg.hosts.remove(&host);
        }
    }

    pub fn create_aggregate(
        &self,
        name: &str,
        availability_zone: Option<String>,
    ) -> Result<AggregateUuid, DirectoryError> {
        if name.trim().is_empty() {
            return Err(DirectoryError::InvalidName(name.to_owned()));
        }
        let mut inner = self.inner.write().unwrap();
        if inner.aggregates.values().any(|a| a.name == name) {
            return Err(DirectoryError::DuplicateAggregate(name.to_owned()));
        }
        let id = AggregateUuid::new_v4();
        info!(self.log, "created aggregate";
              "aggregate" => %id,
              "name" => name,
              "availability_zone" => ?availability_zone);
        inner.aggregates.insert(
            id,
            Aggregate {
                id,
                name: name.to_owned(),
                availability_zone,
                metadata: BTreeMap::new(),
                hosts: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    pub fn delete_aggregate(
        &self,
        id: AggregateUuid,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write().unwrap();
        let agg = inner.aggregate_mut(id)?;
        if !agg.hosts.is_empty() {
            return Err(DirectoryError::AggregateNotEmpty(agg.name.clone()));
        }
        inner.aggregates.remove(&id);
        info!(self.log, "deleted aggregate"; "aggregate" => %id);
        Ok(())
    }

    pub fn aggregate(
        &self,
        id: AggregateUuid,
    ) -> Result<Aggregate, DirectoryError> {
        self.inner
            .read()
            .unwrap()
            .aggregates
            .get(&id)
            .cloned()
            .ok_or_else(|| DirectoryError::AggregateNotFound(id.to_string()))
    }

    pub fn aggregate_by_name(&self, name: &str) -> Option<Aggregate> {
        self.inner
            .read()
            .unwrap()
            .aggregates
            .values()
            .find(|a| a.name == name)
            .cloned()
    }

    pub fn aggregates(&self) -> Vec<Aggregate> {
        self.inner.read().unwrap().aggregates.values().cloned().collect()
    }

    pub fn add_host(
        &self,
        id: AggregateUuid,
        host: HostUuid,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.host_cells.contains_key(&host) {
            return Err(DirectoryError::HostNotFound(host));
        }
        let agg = inner.aggregate_mut(id)?;
        if !agg.hosts.insert(host) {
            return Err(DirectoryError::AlreadyMember(host, agg.name.clone()));
        }
        info!(self.log, "added host to aggregate";
              "aggregate" => &agg.name,
              "host" => %host);
        Ok(())
    }

    /// Removes `host` from an aggregate.
    ///
    /// This is refused if a pending reservation on the host depends on a
    /// metadata key that no other aggregate of the host supplies. The check
    /// is advisory: a reservation made right after it passes is not blocked.
    pub fn remove_host(
        &self,
        id: AggregateUuid,
        host: HostUuid,
        inventory: &ResourceInventory,
    ) -> Result<(), DirectoryError> {
        let pending = inventory
            .pending_tags(host)
            .map_err(|_| DirectoryError::HostNotFound(host))?;

        let mut inner = self.inner.write().unwrap();
        let agg = inner
            .aggregates
            .get(&id)
            .ok_or_else(|| DirectoryError::AggregateNotFound(id.to_string()))?;
        if !agg.hosts.contains(&host) {
            return Err(DirectoryError::NotMember(host, agg.name.clone()));
        }

        let supplied_elsewhere: BTreeSet<&String> = inner
            .aggregates
            .values()
            .filter(|other| other.id != id && other.hosts.contains(&host))
            .flat_map(|other| other.metadata.keys())
            .collect();
        let orphaned: Vec<String> = agg
            .metadata
            .keys()
            .filter(|k| pending.contains(*k) && !supplied_elsewhere.contains(k))
            .cloned()
            .collect();
        if !orphaned.is_empty() {
            return Err(DirectoryError::TagsInUse {
                host,
                aggregate: agg.name.clone(),
                tags: orphaned,
            });
        }

        let agg = inner.aggregate_mut(id)?;
        agg.hosts.remove(&host);
        info!(self.log, "removed host from aggregate";
              "aggregate" => &agg.name,
              "host" => %host);
        Ok(())
    }

    /// Sets (`Some`) or removes (`None`) one metadata key.
    pub fn set_metadata(
        &self,
        id: AggregateUuid,
        key: &str,
        value: Option<String>,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write().unwrap();
        let agg = inner.aggregate_mut(id)?;
        match value {
            Some(v) => agg.metadata.insert(key.to_owned(), v),
            None => agg.metadata.remove(key),
        };
        Ok(())
    }

    pub fn set_availability_zone(
        &self,
        id: AggregateUuid,
        zone: Option<String>,
    ) -> Result<(), DirectoryError> {
        self.inner.write().unwrap().aggregate_mut(id)?.availability_zone = zone;
        Ok(())
    }

    pub fn aggregates_for_host(&self, host: HostUuid) -> Vec<Aggregate> {
        self.inner
            .read()
            .unwrap()
            .aggregates
            .values()
            .filter(|a| a.hosts.contains(&host))
            .cloned()
            .collect()
    }

    /// Returns the union of metadata values for `host`, keyed by metadata key.
    /// A key may carry different values in different aggregates.
    pub fn metadata_for_host(
        &self,
        host: HostUuid,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for agg in self.aggregates_for_host(host) {
            for (k, v) in agg.metadata {
                merged.entry(k).or_default().insert(v);
            }
        }
        merged
    }

    /// Returns the host's availability zone, falling back to the default zone
    /// when none of its aggregates names one.
    pub fn availability_zone_for_host(&self, host: HostUuid) -> String {
        self.aggregates_for_host(host)
            .into_iter()
            .find_map(|a| a.availability_zone)
            .unwrap_or_else(|| self.default_availability_zone.clone())
    }

    pub fn availability_zones(&self) -> BTreeSet<String> {
        let mut zones: BTreeSet<String> = self
            .aggregates()
            .into_iter()
            .filter_map(|a| a.availability_zone)
            .collect();
        zones.insert(self.default_availability_zone.clone());
        zones
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_config::InventoryConfig;
    use corral_types::{Footprint, InstanceUuid};

    use crate::inventory::HostSpec;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn cell(name: &str) -> CellName {
        name.parse().unwrap()
    }

    fn setup() -> (Directory, ResourceInventory, HostUuid) {
        let dir = Directory::new("nova".to_string(), test_logger());
        let inv =
            ResourceInventory::new(&InventoryConfig::default(), test_logger());
        dir.create_cell(cell("root"), None).unwrap();
        let host = inv
            .register_host(HostSpec {
                name: "h1".to_string(),
                cell: cell("root"),
                capacity: Footprint::new(4, 4096, 40),
                capabilities: BTreeMap::new(),
            })
            .unwrap();
        dir.assign_host(host, cell("root")).unwrap();
        (dir, inv, host)
    }

    #[test]
    fn nested_cells_include_children_on_request() {
        let (dir, _inv, host) = setup();
        dir.create_cell(cell("child"), Some(cell("root"))).unwrap();
        let other = HostUuid::new_v4();
        dir.assign_host(other, cell("child")).unwrap();

        let direct = dir.hosts_in_cell(&cell("root"), false).unwrap();
        assert_eq!(direct, vec![host]);
        let mut all = dir.hosts_in_cell(&cell("root"), true).unwrap();
        all.sort();
        let mut expected = vec![host, other];
        expected.sort();
        assert_eq!(all, expected);
        assert!(dir.cell_within(&cell("child"), &cell("root")));
        assert!(!dir.cell_within(&cell("root"), &cell("child")));
    }

    #[test]
    fn unknown_parent_cell_is_rejected() {
        let (dir, _, _) = setup();
        assert_eq!(
            dir.create_cell(cell("x"), Some(cell("nope"))),
            Err(DirectoryError::CellNotFound(cell("nope")))
        );
    }

    #[test]
    fn aggregates_must_be_empty_to_delete() {
        let (dir, inv, host) = setup();
        let agg =
            dir.create_aggregate("fast", Some("az1".to_string())).unwrap();
        dir.add_host(agg, host).unwrap();
        assert!(matches!(
            dir.add_host(agg, host),
            Err(DirectoryError::AlreadyMember(..))
        ));
        assert!(matches!(
            dir.delete_aggregate(agg),
            Err(DirectoryError::AggregateNotEmpty(_))
        ));
        assert_eq!(dir.availability_zone_for_host(host), "az1");

        dir.remove_host(agg, host, &inv).unwrap();
        dir.delete_aggregate(agg).unwrap();
        assert_eq!(dir.availability_zone_for_host(host), "nova");
    }

    #[test]
    fn removing_last_supplier_of_a_pending_tag_is_refused() {
        let (dir, inv, host) = setup();
        let agg = dir.create_aggregate("ssd", None).unwrap();
        dir.set_metadata(agg, "ssd", Some("true".to_string())).unwrap();
        dir.add_host(agg, host).unwrap();

        let res = inv
            .reserve(
                host,
                Footprint::new(1, 1, 1),
                InstanceUuid::new_v4(),
                ["ssd".to_string()].into(),
            )
            .unwrap();
        assert!(matches!(
            dir.remove_host(agg, host, &inv),
            Err(DirectoryError::TagsInUse { .. })
        ));

        // A second aggregate supplying the same key makes removal safe.
        let other = dir.create_aggregate("ssd-too", None).unwrap();
        dir.set_metadata(other, "ssd", Some("true".to_string())).unwrap();
        dir.add_host(other, host).unwrap();
        dir.remove_host(agg, host, &inv).unwrap();

        inv.release(res);
        dir.remove_host(other, host, &inv).unwrap();
    }

    #[test]
    fn metadata_merges_across_aggregates() {
        let (dir, _, host) = setup();
        let a = dir.create_aggregate("a", None).unwrap();
        let b = dir.create_aggregate("b", None).unwrap();
        dir.set_metadata(a, "tier", Some("gold".to_string())).unwrap();
        dir.set_metadata(b, "tier", Some("silver".to_string())).unwrap();
        dir.add_host(a, host).unwrap();
        dir.add_host(b, host).unwrap();
        let md = dir.metadata_for_host(host);
        assert_eq!(md["tier"].len(), 2);

        dir.set_metadata(b, "tier", None).unwrap();
        assert_eq!(dir.metadata_for_host(host)["tier"].len(), 1);
    }
}
