// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chooses hosts for new, resized, and moving instances.
//!
//! Placement runs in three phases. Every known host is first passed through
//! the configured filter chain; survivors are then ranked by the weighted sum
//! of the weighers' scores; finally the scheduler walks the ranking and asks
//! the inventory to reserve the requested footprint on each host in turn.
//! Because the reservation is checked and recorded under the host's lock,
//! a host that filled up between filtering and reservation simply loses the
//! race and the next candidate is tried. Only a successful reservation is
//! returned to the caller, which must commit or release it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use corral_config::SchedulerConfig;
use corral_types::{
    CellName, Footprint, HostUuid, InstanceUuid, ReservationUuid,
};
use slog::{debug, info, warn, Logger};
use thiserror::Error;

use crate::directory::Directory;
use crate::inventory::{HostInfo, InventoryError, ResourceInventory};

pub mod filters;
pub mod weights;

pub use filters::{FilterRegistry, HostFilter};
pub use weights::{AffinityWeigher, HostWeigher, SpareCapacityWeigher};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("{0}")]
    NoValidHost(String),

    #[error("Unknown scheduler filter {0:?}")]
    UnknownFilter(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// What is being placed.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub instance: InstanceUuid,
    pub footprint: Footprint,
    pub availability_zone: Option<String>,
    pub cell: Option<CellName>,

    /// Flavor extra specs, optionally scoped with `scope:key`.
    pub extra_specs: BTreeMap<String, String>,
    pub image_properties: BTreeMap<String, String>,
}

impl RequestSpec {
    pub fn new(instance: InstanceUuid, footprint: Footprint) -> Self {
        Self {
            instance,
            footprint,
            availability_zone: None,
            cell: None,
            extra_specs: BTreeMap::new(),
            image_properties: BTreeMap::new(),
        }
    }

    /// The aggregate metadata keys this request depends on. These are recorded
    /// with the reservation so that aggregate membership changes can tell
    /// which in-flight placements they would invalidate.
    pub fn required_tags(&self) -> BTreeSet<String> {
        self.extra_specs
            .keys()
            .filter_map(|key| match key.split_once(':') {
                None => Some(key.clone()),
                Some((filters::AGGREGATE_SCOPE, k)) => Some(k.to_owned()),
                Some(_) => None,
            })
            .collect()
    }
}

/// Placement hints, with any instance references already resolved to the
/// hosts those instances run on.
#[derive(Clone, Debug, Default)]
pub struct SchedulerHints {
    pub same_host: BTreeSet<HostUuid>,
    pub different_host: BTreeSet<HostUuid>,
    pub ignore_hosts: BTreeSet<HostUuid>,
    pub force_hosts: BTreeSet<HostUuid>,
    pub soft_affinity: BTreeSet<HostUuid>,
    pub soft_anti_affinity: BTreeSet<HostUuid>,
}

/// A host as the filters and weighers see it.
#[derive(Clone, Debug)]
pub struct HostCandidate {
    pub info: HostInfo,
    pub metadata: BTreeMap<String, BTreeSet<String>>,
    pub availability_zone: String,
}

pub struct FilterContext<'a> {
    pub spec: &'a RequestSpec,
    pub hints: &'a SchedulerHints,
    pub directory: &'a Directory,
}

/// A host chosen for a request, with capacity already reserved on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub host: HostUuid,
    pub reservation: ReservationUuid,
}

pub struct Scheduler {
    inventory: Arc<ResourceInventory>,
    directory: Arc<Directory>,
    filters: Vec<Box<dyn HostFilter>>,
    weighers: Vec<(f64, Box<dyn HostWeigher>)>,
    max_attempts: u32,
    log: Logger,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        registry: &FilterRegistry,
        inventory: Arc<ResourceInventory>,
        directory: Arc<Directory>,
        log: Logger,
    ) -> Result<Self, SchedulerError> {
        let filters = registry.build(&config.filters)?;
        let spare: Box<dyn HostWeigher> = Box::new(SpareCapacityWeigher);
        let affinity: Box<dyn HostWeigher> = Box::new(AffinityWeigher);
        let weighers = vec![
            (config.spare_capacity_weight, spare),
            (config.affinity_weight, affinity),
        ];
        let names: Vec<_> = filters.iter().map(|f| f.name()).collect();
        info!(log, "scheduler ready";
              "filters" => ?names,
              "max_attempts" => config.max_attempts);
        Ok(Self {
            inventory,
            directory,
            filters,
            weighers,
            max_attempts: config.max_attempts,
            log,
        })
    }

    pub fn inventory(&self) -> &Arc<ResourceInventory> {
        &self.inventory
    }

    fn candidates(&self) -> Vec<HostCandidate> {
        self.inventory
            .hosts()
            .into_iter()
            .map(|info| HostCandidate {
                metadata: self.directory.metadata_for_host(info.id),
                availability_zone: self
                    .directory
                    .availability_zone_for_host(info.id),
                info,
            })
            .collect()
    }

    /// Returns the hosts that pass `filters`, best first.
    fn rank(
        &self,
        spec: &RequestSpec,
        hints: &SchedulerHints,
        filters: &[Box<dyn HostFilter>],
    ) -> Vec<HostCandidate> {
        let ctx = FilterContext { spec, hints, directory: &self.directory };
        let mut survivors: Vec<(f64, HostCandidate)> = Vec::new();
        for host in self.candidates() {
            if let Some(failed) =
                filters.iter().find(|f| !f.host_passes(&host, &ctx))
            {
                debug!(self.log, "host filtered out";
                       "host" => &host.info.name,
                       "filter" => failed.name());
                continue;
            }
            let weight: f64 = self
                .weighers
                .iter()
                .map(|(mult, w)| mult * w.weigh(&host, &ctx))
                .sum();
            survivors.push((weight, host));
        }
        survivors.sort_by(|(wa, a), (wb, b)| {
            wb.total_cmp(wa).then_with(|| a.info.name.cmp(&b.info.name))
        });
        survivors.into_iter().map(|(_, host)| host).collect()
    }

    /// Places `spec` using the configured filter chain.
    pub fn select_host(
        &self,
        spec: &RequestSpec,
        hints: &SchedulerHints,
    ) -> Result<Selection, SchedulerError> {
        self.select_host_with(spec, hints, &self.filters)
    }

    /// Places `spec` using an explicit filter chain.
    pub fn select_host_with(
        &self,
        spec: &RequestSpec,
        hints: &SchedulerHints,
        filters: &[Box<dyn HostFilter>],
    ) -> Result<Selection, SchedulerError> {
        let ranked = self.rank(spec, hints, filters);
        if ranked.is_empty() {
            info!(self.log, "no host passed the filters";
                  "instance" => %spec.instance,
                  "footprint" => %spec.footprint);
            return Err(SchedulerError::NoValidHost(format!(
                "no host can accommodate {}",
                spec.footprint
            )));
        }

        let tags = spec.required_tags();
        let mut attempts = 0;
        for host in ranked {
            if attempts == self.max_attempts {
                break;
            }
            attempts += 1;
            match self.inventory.reserve(
                host.info.id,
                spec.footprint,
                spec.instance,
                tags.clone(),
            ) {
                Ok(reservation) => {
                    info!(self.log, "selected host";
                          "instance" => %spec.instance,
                          "host" => &host.info.name,
                          "reservation" => %reservation,
                          "attempt" => attempts);
                    return Ok(Selection { host: host.info.id, reservation });
                }
                Err(e @ InventoryError::InsufficientCapacity { .. })
                | Err(e @ InventoryError::HostNotFound(_)) => {
                    warn!(self.log, "lost reservation race";
                          "instance" => %spec.instance,
                          "host" => &host.info.name,
                          "error" => %e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SchedulerError::NoValidHost(format!(
            "all {} reservation attempts failed for {}",
            attempts, spec.footprint
        )))
    }

    /// Places a batch of instances. Up to `specs.len()` are placed; if fewer
    /// than `min_count` succeed, every reservation made for the batch is
    /// released and the batch fails.
    pub fn select_batch(
        &self,
        specs: &[RequestSpec],
        hints: &SchedulerHints,
        min_count: usize,
    ) -> Result<Vec<Selection>, SchedulerError> {
        let mut placed = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.select_host(spec, hints) {
                Ok(selection) => placed.push(selection),
                Err(e) if placed.len() >= min_count => {
                    info!(self.log, "batch partially placed";
                          "placed" => placed.len(),
                          "requested" => specs.len(),
                          "error" => %e);
                    break;
                }
                Err(e) => {
                    for selection in &placed {
                        self.inventory.release(selection.reservation);
                    }
                    warn!(self.log, "batch could not reach its minimum";
                          "placed" => placed.len(),
                          "min_count" => min_count,
                          "error" => %e);
                    return Err(SchedulerError::NoValidHost(format!(
                        "only {} of the minimum {} instances could be placed",
                        placed.len(),
                        min_count
                    )));
                }
            }
        }
        Ok(placed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_config::InventoryConfig;

    use crate::inventory::HostSpec;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    struct Fixture {
        inventory: Arc<ResourceInventory>,
        directory: Arc<Directory>,
        scheduler: Scheduler,
    }

    fn fixture(hosts: &[(&str, Footprint)]) -> (Fixture, Vec<HostUuid>) {
        let inventory = Arc::new(ResourceInventory::new(
            &InventoryConfig::default(),
            test_logger(),
        ));
        let directory =
            Arc::new(Directory::new("nova".to_string(), test_logger()));
        let root: CellName = "root".parse().unwrap();
        directory.create_cell(root.clone(), None).unwrap();
        let ids = hosts
            .iter()
            .map(|(name, cap)| {
                let id = inventory
                    .register_host(HostSpec {
                        name: name.to_string(),
                        cell: root.clone(),
                        capacity: *cap,
                        capabilities: BTreeMap::new(),
                    })
                    .unwrap();
                directory.assign_host(id, root.clone()).unwrap();
                id
            })
            .collect();
        let scheduler = Scheduler::new(
            &SchedulerConfig::default(),
            &FilterRegistry::builtin(),
            inventory.clone(),
            directory.clone(),
            test_logger(),
        )
        .unwrap();
        (Fixture { inventory, directory, scheduler }, ids)
    }

    fn spec(footprint: Footprint) -> RequestSpec {
        RequestSpec::new(InstanceUuid::new_v4(), footprint)
    }

    #[test]
    fn picks_emptiest_host_and_reserves() {
        let (f, ids) = fixture(&[
            ("small", Footprint::new(2, 2048, 20)),
            ("large", Footprint::new(8, 8192, 80)),
        ]);
        let sel = f
            .scheduler
            .select_host(&spec(Footprint::new(1, 512, 5)), &Default::default())
            .unwrap();
        assert_eq!(sel.host, ids[1]);
        assert_eq!(
            f.inventory.usage(ids[1]).unwrap().reserved,
            Footprint::new(1, 512, 5)
        );
    }

    #[test]
    fn no_valid_host_when_nothing_fits() {
        let (f, _) = fixture(&[("h", Footprint::new(2, 2048, 20))]);
        let err = f
            .scheduler
            .select_host(&spec(Footprint::new(4, 512, 5)), &Default::default())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoValidHost(_)));
    }

    #[test]
    fn never_overcommits_under_repeated_selection() {
        let (f, ids) = fixture(&[
            ("a", Footprint::new(4, 4096, 40)),
            ("b", Footprint::new(4, 4096, 40)),
        ]);
        let mut placed = 0;
        for _ in 0..10 {
            let small = spec(Footprint::new(1, 1024, 10));
            if f.scheduler.select_host(&small, &Default::default()).is_ok() {
                placed += 1;
            }
        }
        assert_eq!(placed, 8);
        for id in ids {
            let usage = f.inventory.usage(id).unwrap();
            assert!(usage.in_use().fits_within(&usage.total));
        }
    }

    #[test]
    fn aggregate_metadata_steers_placement() {
        let (f, ids) = fixture(&[
            ("plain", Footprint::new(8, 8192, 80)),
            ("fast", Footprint::new(4, 4096, 40)),
        ]);
        let agg = f.directory.create_aggregate("fast", None).unwrap();
        f.directory
            .set_metadata(agg, "ssd", Some("true".to_string()))
            .unwrap();
        f.directory.add_host(agg, ids[1]).unwrap();

        let mut s = spec(Footprint::new(1, 512, 5));
        s.extra_specs.insert(
            "aggregate_instance_extra_specs:ssd".to_string(),
            "true".to_string(),
        );
        let sel = f.scheduler.select_host(&s, &Default::default()).unwrap();
        assert_eq!(sel.host, ids[1]);
        assert_eq!(
            f.inventory.pending_tags(ids[1]).unwrap(),
            BTreeSet::from(["ssd".to_string()])
        );
    }

    #[test]
    fn availability_zone_restricts_candidates() {
        let (f, ids) = fixture(&[
            ("a", Footprint::new(8, 8192, 80)),
            ("b", Footprint::new(4, 4096, 40)),
        ]);
        let agg = f
            .directory
            .create_aggregate("zone-b", Some("az-b".to_string()))
            .unwrap();
        f.directory.add_host(agg, ids[1]).unwrap();

        let mut s = spec(Footprint::new(1, 512, 5));
        s.availability_zone = Some("az-b".to_string());
        assert_eq!(
            f.scheduler.select_host(&s, &Default::default()).unwrap().host,
            ids[1]
        );
        s.availability_zone = Some("nova".to_string());
        assert_eq!(
            f.scheduler.select_host(&s, &Default::default()).unwrap().host,
            ids[0]
        );
    }

    #[test]
    fn soft_affinity_outweighs_spare_capacity() {
        let (f, ids) = fixture(&[
            ("big", Footprint::new(8, 8192, 80)),
            ("small", Footprint::new(4, 4096, 40)),
        ]);
        let mut hints = SchedulerHints::default();
        hints.soft_affinity.insert(ids[1]);
        let sel = f
            .scheduler
            .select_host(&spec(Footprint::new(1, 512, 5)), &hints)
            .unwrap();
        assert_eq!(sel.host, ids[1]);
    }

    #[test]
    fn batch_below_minimum_releases_everything() {
        let (f, ids) = fixture(&[("only", Footprint::new(2, 2048, 20))]);
        let specs: Vec<_> =
            (0..3).map(|_| spec(Footprint::new(2, 1024, 10))).collect();
        let err = f
            .scheduler
            .select_batch(&specs, &Default::default(), 2)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoValidHost(_)));
        let usage = f.inventory.usage(ids[0]).unwrap();
        assert_eq!(usage.in_use(), Footprint::ZERO);
    }

    #[test]
    fn batch_above_minimum_keeps_what_fit() {
        let (f, _) = fixture(&[("only", Footprint::new(4, 4096, 40))]);
        let specs: Vec<_> =
            (0..3).map(|_| spec(Footprint::new(2, 1024, 10))).collect();
        let placed = f
            .scheduler
            .select_batch(&specs, &Default::default(), 1)
            .unwrap();
        assert_eq!(placed.len(), 2);
    }
}
