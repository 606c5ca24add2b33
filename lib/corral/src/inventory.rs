// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracks each host's capacity and the allocations made against it.
//!
//! Capacity only changes through the reservation protocol: a scheduler
//! `reserve`s a footprint on a host, the orchestrator later `commit`s the
//! reservation once the instance actually lands there, and `release` gives the
//! capacity back. Reservations that are not committed within the configured
//! TTL are dropped by [`ResourceInventory::reap_expired`] so that a crashed or
//! abandoned operation cannot leak capacity.
//!
//! Every mutation of a given host's figures happens under that host's own
//! mutex, which makes reservation checks linearizable per host without
//! serializing work on unrelated hosts. None of these locks is ever held
//! across an await point.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use corral_config::InventoryConfig;
use corral_types::{
    CellName, Footprint, HostUuid, InstanceUuid, ReservationUuid,
};
use serde::Serialize;
use slog::{debug, info, warn, Logger};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("Host {0} not found")]
    HostNotFound(HostUuid),

    #[error("A host named {0:?} is already registered")]
    DuplicateHost(String),

    #[error("Host {host} cannot fit {requested} (free: {free})")]
    InsufficientCapacity {
        host: HostUuid,
        requested: Footprint,
        free: Footprint,
    },

    #[error("Reservation {0} not found")]
    ReservationNotFound(ReservationUuid),

    #[error("Reservation {0} expired before it was committed")]
    ReservationExpired(ReservationUuid),

    #[error("Host {0} still has allocations")]
    HostInUse(HostUuid),
}

/// The information needed to add a host to the inventory.
#[derive(Clone, Debug)]
pub struct HostSpec {
    pub name: String,
    pub cell: CellName,

    /// Physical capacity, before allocation ratios are applied.
    pub capacity: Footprint,
    pub capabilities: BTreeMap<String, String>,
}

/// A point-in-time view of a host's capacity figures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct HostUsage {
    /// Schedulable capacity (physical capacity scaled by allocation ratios).
    pub total: Footprint,
    pub committed: Footprint,
    pub reserved: Footprint,
}

impl HostUsage {
    pub fn in_use(&self) -> Footprint {
        // Allocations are only admitted when they fit within `total`, so this
        // sum cannot overflow.
        self.committed.checked_add(&self.reserved).unwrap_or(self.total)
    }

    pub fn free(&self) -> Footprint {
        self.total.saturating_sub(&self.in_use())
    }

    pub fn can_fit(&self, footprint: &Footprint) -> bool {
        match self.in_use().checked_add(footprint) {
            Some(wanted) => wanted.fits_within(&self.total),
            None => false,
        }
    }
}

/// A snapshot of a host's record.
#[derive(Clone, Debug, Serialize)]
pub struct HostInfo {
    pub id: HostUuid,
    pub name: String,
    pub cell: CellName,
    pub capabilities: BTreeMap<String, String>,
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub maintenance: bool,
    pub forced_down: bool,
    pub up: bool,
    pub usage: HostUsage,
}

impl HostInfo {
    /// Returns true if new work may be placed on this host.
    pub fn accepts_new_work(&self) -> bool {
        self.enabled && self.up && !self.maintenance
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocationState {
    Reserved { expires_at: Instant },
    Committed,
}

/// One claim against a host's capacity.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub id: ReservationUuid,
    pub host: HostUuid,
    pub consumer: InstanceUuid,
    pub footprint: Footprint,

    /// Scheduling tags (aggregate metadata keys) the placement relied on.
    pub tags: BTreeSet<String>,
    pub state: AllocationState,
}

impl Allocation {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.state, AllocationState::Reserved { expires_at }
            if expires_at <= now)
    }
}

#[derive(Debug)]
struct HostEntry {
    id: HostUuid,
    name: String,
    cell: CellName,
    total: Footprint,
    capabilities: BTreeMap<String, String>,
    enabled: bool,
    disabled_reason: Option<String>,
    maintenance: bool,
    forced_down: bool,
    last_heartbeat: Instant,
    allocations: BTreeMap<ReservationUuid, Allocation>,
}

impl HostEntry {
    fn usage(&self) -> HostUsage {
        let mut committed = Footprint::ZERO;
        let mut reserved = Footprint::ZERO;
        for alloc in self.allocations.values() {
            let bucket = match alloc.state {
                AllocationState::Committed => &mut committed,
                AllocationState::Reserved { .. } => &mut reserved,
            };
            *bucket =
                bucket.checked_add(&alloc.footprint).unwrap_or(self.total);
        }
        HostUsage { total: self.total, committed, reserved }
    }

    fn is_up(&self, now: Instant, down_after: Duration) -> bool {
        !self.forced_down
            && now.duration_since(self.last_heartbeat) < down_after
    }

    fn info(&self, now: Instant, down_after: Duration) -> HostInfo {
        HostInfo {
            id: self.id,
            name: self.name.clone(),
            cell: self.cell.clone(),
            capabilities: self.capabilities.clone(),
            enabled: self.enabled,
            disabled_reason: self.disabled_reason.clone(),
            maintenance: self.maintenance,
            forced_down: self.forced_down,
            up: self.is_up(now, down_after),
            usage: self.usage(),
        }
    }

    /// Drops this host's expired reservations and returns them.
    fn prune_expired(&mut self, now: Instant) -> Vec<Allocation> {
        let expired: Vec<ReservationUuid> = self
            .allocations
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.allocations.remove(&id))
            .collect()
    }
}

pub struct ResourceInventory {
    hosts: RwLock<BTreeMap<HostUuid, Arc<Mutex<HostEntry>>>>,

    /// Maps each live allocation to the host that holds it. Lock order is
    /// always host entry, then index.
    index: Mutex<BTreeMap<ReservationUuid, HostUuid>>,
    reservation_ttl: Duration,
    service_down_time: Duration,
    cpu_ratio: f64,
    ram_ratio: f64,
    disk_ratio: f64,
    log: Logger,
}

impl ResourceInventory {
    pub fn new(config: &InventoryConfig, log: Logger) -> Self {
        Self {
            hosts: RwLock::new(BTreeMap::new()),
            index: Mutex::new(BTreeMap::new()),
            reservation_ttl: config.reservation_ttl(),
            service_down_time: config.service_down_time(),
            cpu_ratio: config.cpu_allocation_ratio,
            ram_ratio: config.ram_allocation_ratio,
            disk_ratio: config.disk_allocation_ratio,
            log,
        }
    }

    pub fn reservation_ttl(&self) -> Duration {
        self.reservation_ttl
    }

    fn entry(
        &self,
        id: HostUuid,
    ) -> Result<Arc<Mutex<HostEntry>>, InventoryError> {
        self.hosts
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(InventoryError::HostNotFound(id))
    }

    fn with_entry<T>(
        &self,
        id: HostUuid,
        f: impl FnOnce(&mut HostEntry) -> T,
    ) -> Result<T, InventoryError> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().unwrap();
        Ok(f(&mut guard))
    }

    /// Adds a host to the inventory. The host starts enabled and up.
    pub fn register_host(
        &self,
        spec: HostSpec,
    ) -> Result<HostUuid, InventoryError> {
        let mut hosts = self.hosts.write().unwrap();
        if hosts.values().any(|e| e.lock().unwrap().name == spec.name) {
            return Err(InventoryError::DuplicateHost(spec.name));
        }

        let id = HostUuid::new_v4();
        let total = spec.capacity.scaled(
            self.cpu_ratio,
            self.ram_ratio,
            self.disk_ratio,
        );
        info!(self.log, "registering host";
              "host" => %id,
              "name" => &spec.name,
              "cell" => %spec.cell,
              "schedulable" => %total);

        hosts.insert(
            id,
            Arc::new(Mutex::new(HostEntry {
                id,
                name: spec.name,
                cell: spec.cell,
                total,
                capabilities: spec.capabilities,
                enabled: true,
                disabled_reason: None,
                maintenance: false,
                forced_down: false,
                last_heartbeat: Instant::now(),
                allocations: BTreeMap::new(),
            })),
        );
        Ok(id)
    }

    /// Removes a host that holds no allocations.
    pub fn remove_host(&self, id: HostUuid) -> Result<(), InventoryError> {
        let mut hosts = self.hosts.write().unwrap();
        let entry = hosts.get(&id).ok_or(InventoryError::HostNotFound(id))?;
        if !entry.lock().unwrap().allocations.is_empty() {
            return Err(InventoryError::HostInUse(id));
        }
        hosts.remove(&id);
        info!(self.log, "removed host"; "host" => %id);
        Ok(())
    }

    pub fn host_by_name(&self, name: &str) -> Option<HostUuid> {
        self.hosts
            .read()
            .unwrap()
            .values()
            .map(|e| e.lock().unwrap())
            .find(|e| e.name == name)
            .map(|e| e.id)
    }

    pub fn host(&self, id: HostUuid) -> Result<HostInfo, InventoryError> {
        let now = Instant::now();
        self.with_entry(id, |e| e.info(now, self.service_down_time))
    }

    pub fn hosts(&self) -> Vec<HostInfo> {
        let now = Instant::now();
        self.hosts
            .read()
            .unwrap()
            .values()
            .map(|e| e.lock().unwrap().info(now, self.service_down_time))
            .collect()
    }

    pub fn usage(&self, id: HostUuid) -> Result<HostUsage, InventoryError> {
        self.with_entry(id, |e| e.usage())
    }

    pub fn set_enabled(
        &self,
        id: HostUuid,
        enabled: bool,
        reason: Option<String>,
    ) -> Result<(), InventoryError> {
        info!(self.log, "setting host service status";
              "host" => %id,
              "enabled" => enabled,
              "reason" => ?reason);
        self.with_entry(id, |e| {
            e.enabled = enabled;
            e.disabled_reason = if enabled { None } else { reason };
        })
    }

    pub fn set_maintenance(
        &self,
        id: HostUuid,
        maintenance: bool,
    ) -> Result<(), InventoryError> {
        info!(self.log, "setting host maintenance mode";
              "host" => %id,
              "maintenance" => maintenance);
        self.with_entry(id, |e| e.maintenance = maintenance)
    }

    /// Marks a host down regardless of its heartbeats. Used by operators who
    /// know a host is dead before its heartbeat goes stale.
    pub fn set_forced_down(
        &self,
        id: HostUuid,
        forced_down: bool,
    ) -> Result<(), InventoryError> {
        warn!(self.log, "setting host forced-down flag";
              "host" => %id,
              "forced_down" => forced_down);
        self.with_entry(id, |e| e.forced_down = forced_down)
    }

    pub fn record_heartbeat(&self, id: HostUuid) -> Result<(), InventoryError> {
        let now = Instant::now();
        self.with_entry(id, |e| e.last_heartbeat = now)
    }

    /// Returns whether the host's service is currently considered up.
    pub fn is_up(&self, id: HostUuid) -> Result<bool, InventoryError> {
        let now = Instant::now();
        self.with_entry(id, |e| e.is_up(now, self.service_down_time))
    }

    /// Provisionally claims `footprint` on `host` for `consumer`.
    ///
    /// The capacity check and the claim happen under the host's lock, so two
    /// concurrent callers can never both succeed when the host only has room
    /// for one of them.
    pub fn reserve(
        &self,
        host: HostUuid,
        footprint: Footprint,
        consumer: InstanceUuid,
        tags: BTreeSet<String>,
    ) -> Result<ReservationUuid, InventoryError> {
        let entry = self.entry(host)?;
        let now = Instant::now();
        let mut guard = entry.lock().unwrap();

        let expired = guard.prune_expired(now);
        if !expired.is_empty() {
            self.forget(&expired);
        }

        let usage = guard.usage();
        if !usage.can_fit(&footprint) {
            debug!(self.log, "reservation denied";
                   "host" => %host,
                   "requested" => %footprint,
                   "free" => %usage.free());
            return Err(InventoryError::InsufficientCapacity {
                host,
                requested: footprint,
                free: usage.free(),
            });
        }

        let id = ReservationUuid::new_v4();
        guard.allocations.insert(
            id,
            Allocation {
                id,
                host,
                consumer,
                footprint,
                tags,
                state: AllocationState::Reserved {
                    expires_at: now + self.reservation_ttl,
                },
            },
        );
        self.index.lock().unwrap().insert(id, host);

        debug!(self.log, "reserved capacity";
               "reservation" => %id,
               "host" => %host,
               "consumer" => %consumer,
               "footprint" => %footprint);
        Ok(id)
    }

    fn host_of(
        &self,
        id: ReservationUuid,
    ) -> Result<HostUuid, InventoryError> {
        self.index
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .ok_or(InventoryError::ReservationNotFound(id))
    }

    fn forget(&self, allocations: &[Allocation]) {
        let mut index = self.index.lock().unwrap();
        for alloc in allocations {
            index.remove(&alloc.id);
            info!(self.log, "reservation expired";
                  "reservation" => %alloc.id,
                  "host" => %alloc.host,
                  "consumer" => %alloc.consumer);
        }
    }

    /// Converts a reservation into a committed allocation. Committing an
    /// already-committed allocation succeeds.
    pub fn commit(&self, id: ReservationUuid) -> Result<(), InventoryError> {
        let host = self.host_of(id)?;
        let entry = self.entry(host)?;
        let now = Instant::now();
        let mut guard = entry.lock().unwrap();

        let alloc = guard
            .allocations
            .get_mut(&id)
            .ok_or(InventoryError::ReservationNotFound(id))?;
        if alloc.is_expired(now) {
            let alloc = guard.allocations.remove(&id);
            self.forget(&alloc.into_iter().collect::<Vec<_>>());
            return Err(InventoryError::ReservationExpired(id));
        }

        alloc.state = AllocationState::Committed;
        debug!(self.log, "committed reservation";
               "reservation" => %id,
               "host" => %host);
        Ok(())
    }

    /// Pushes an uncommitted reservation's expiry out by another TTL.
    pub fn renew(&self, id: ReservationUuid) -> Result<(), InventoryError> {
        let host = self.host_of(id)?;
        let entry = self.entry(host)?;
        let now = Instant::now();
        let mut guard = entry.lock().unwrap();

        let alloc = guard
            .allocations
            .get_mut(&id)
            .ok_or(InventoryError::ReservationNotFound(id))?;
        match alloc.state {
            AllocationState::Committed => Ok(()),
            AllocationState::Reserved { expires_at } if expires_at <= now => {
                Err(InventoryError::ReservationExpired(id))
            }
            AllocationState::Reserved { .. } => {
                alloc.state = AllocationState::Reserved {
                    expires_at: now + self.reservation_ttl,
                };
                Ok(())
            }
        }
    }

    /// Gives a reservation's or allocation's capacity back to its host.
    ///
    /// Releasing is idempotent: the first call returns the released
    /// allocation, and later calls (or calls racing with the reaper) return
    /// `None` without touching the host's figures again.
    pub fn release(&self, id: ReservationUuid) -> Option<Allocation> {
        let host = self.index.lock().unwrap().remove(&id)?;
        let entry = self.entry(host).ok()?;
        let released = entry.lock().unwrap().allocations.remove(&id);
        if let Some(alloc) = &released {
            debug!(self.log, "released allocation";
                   "reservation" => %id,
                   "host" => %host,
                   "footprint" => %alloc.footprint);
        }
        released
    }

    pub fn allocation(&self, id: ReservationUuid) -> Option<Allocation> {
        let host = self.host_of(id).ok()?;
        let entry = self.entry(host).ok()?;
        let guard = entry.lock().unwrap();
        guard.allocations.get(&id).cloned()
    }

    /// Returns every live allocation held on behalf of `consumer`.
    pub fn allocations_for(&self, consumer: InstanceUuid) -> Vec<Allocation> {
        self.hosts
            .read()
            .unwrap()
            .values()
            .flat_map(|e| {
                e.lock()
                    .unwrap()
                    .allocations
                    .values()
                    .filter(|a| a.consumer == consumer)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Returns the scheduling tags that uncommitted reservations on `host`
    /// depend on.
    pub fn pending_tags(
        &self,
        host: HostUuid,
    ) -> Result<BTreeSet<String>, InventoryError> {
        self.with_entry(host, |e| {
            e.allocations
                .values()
                .filter(|a| matches!(a.state, AllocationState::Reserved { .. }))
                .flat_map(|a| a.tags.iter().cloned())
                .collect()
        })
    }

    /// Releases every reservation whose TTL has elapsed.
    pub fn reap_expired(&self) -> Vec<Allocation> {
        let now = Instant::now();
        let entries: Vec<_> =
            self.hosts.read().unwrap().values().cloned().collect();
        let mut reaped = Vec::new();
        for entry in entries {
            let mut guard = entry.lock().unwrap();
            let expired = guard.prune_expired(now);
            if !expired.is_empty() {
                self.forget(&expired);
                reaped.extend(expired);
            }
        }
        reaped
    }
}
