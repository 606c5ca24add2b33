// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes an orchestrator config which may be parsed from a TOML file.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use corral_types::{CellName, Footprint};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the orchestrator.
///
/// Every section may be omitted, in which case its defaults apply. The
/// `cell`, `host` and `aggregate` tables describe a static cluster topology
/// used to seed the inventory at startup.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub inventory: InventoryConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub volume: VolumeConfig,

    #[serde(default, rename = "cell")]
    pub cells: Vec<CellConfig>,

    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,

    #[serde(default, rename = "aggregate")]
    pub aggregates: Vec<AggregateConfig>,

    #[serde(default, rename = "floating_ip_pool")]
    pub floating_ip_pools: Vec<FloatingIpPoolConfig>,
}

/// Placement policy knobs.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Names of the host filters to apply, in order.
    pub filters: Vec<String>,

    /// How many ranked candidates to try reserving before giving up.
    pub max_attempts: u32,

    pub spare_capacity_weight: f64,
    pub affinity_weight: f64,

    /// Allows a resize to land on the instance's current host.
    pub allow_resize_to_same_host: bool,

    /// The availability zone of hosts that are in no zoned aggregate.
    pub default_availability_zone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            filters: [
                "compute",
                "capacity",
                "availability_zone",
                "aggregate_metadata",
                "capabilities",
                "cell",
                "ignore_hosts",
                "same_host",
                "different_host",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_attempts: 3,
            spare_capacity_weight: 1.0,
            affinity_weight: 1.0,
            allow_resize_to_same_host: false,
            default_availability_zone: "nova".to_string(),
        }
    }
}

/// Capacity accounting knobs.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct InventoryConfig {
    /// Uncommitted reservations older than this are released.
    pub reservation_ttl_secs: u64,

    /// A host with no heartbeat for this long is considered down.
    pub service_down_time_secs: u64,

    pub cpu_allocation_ratio: f64,
    pub ram_allocation_ratio: f64,
    pub disk_allocation_ratio: f64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 60,
            service_down_time_secs: 60,
            cpu_allocation_ratio: 1.0,
            ram_allocation_ratio: 1.0,
            disk_allocation_ratio: 1.0,
        }
    }
}

impl InventoryConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn service_down_time(&self) -> Duration {
        Duration::from_secs(self.service_down_time_secs)
    }
}

/// Retry policy for calls to external services.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,

    /// Upper bound on a single external call.
    pub step_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 100,
            max_interval_ms: 5_000,
            multiplier: 2.0,
            step_timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Timers that govern multi-step and deferred lifecycle operations.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// When nonzero, deletes are soft and reclaimed after this long.
    pub reclaim_instance_interval_secs: u64,

    /// When nonzero, resizes awaiting confirmation are confirmed
    /// automatically after this long.
    pub resize_confirm_window_secs: u64,

    /// How long a deleted instance's record stays queryable.
    pub deleted_retention_secs: u64,

    /// Period of the background maintenance pass.
    pub maintenance_interval_secs: u64,

    /// Largest `max_count` accepted by a create request.
    pub max_batch_size: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reclaim_instance_interval_secs: 0,
            resize_confirm_window_secs: 0,
            deleted_retention_secs: 3600,
            maintenance_interval_secs: 10,
            max_batch_size: 64,
        }
    }
}

impl LifecycleConfig {
    pub fn reclaim_instance_interval(&self) -> Option<Duration> {
        (self.reclaim_instance_interval_secs > 0)
            .then(|| Duration::from_secs(self.reclaim_instance_interval_secs))
    }

    pub fn resize_confirm_window(&self) -> Option<Duration> {
        (self.resize_confirm_window_secs > 0)
            .then(|| Duration::from_secs(self.resize_confirm_window_secs))
    }

    pub fn deleted_retention(&self) -> Duration {
        Duration::from_secs(self.deleted_retention_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

/// Volume connection drivers to make available.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct VolumeConfig {
    pub drivers: Vec<String>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            drivers: ["iscsi", "nfs", "rbd", "local"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CellConfig {
    pub name: CellName,

    #[serde(default)]
    pub parent: Option<CellName>,
}

/// A compute host in the static topology.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct HostConfig {
    pub name: String,
    pub cell: CellName,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,

    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

impl HostConfig {
    pub fn capacity(&self) -> Footprint {
        Footprint::new(self.vcpus, self.memory_mib, self.disk_gib)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct AggregateConfig {
    pub name: String,

    #[serde(default)]
    pub availability_zone: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Names of member hosts.
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// A named set of floating addresses.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct FloatingIpPoolConfig {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Errors which may be returned when parsing the orchestrator configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("{0} {1:?} is declared more than once")]
    Duplicate(&'static str, String),

    #[error("{0} {1:?} refers to unknown {2} {3:?}")]
    UnknownReference(&'static str, String, &'static str, String),
}

impl Config {
    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.retry.max_attempts == 0 {
            return Err(ParseError::InvalidValue(
                "retry.max_attempts",
                "must be at least 1".to_string(),
            ));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(ParseError::InvalidValue(
                "retry.multiplier",
                format!("{} is less than 1.0", self.retry.multiplier),
            ));
        }
        if self.retry.step_timeout_ms == 0 {
            return Err(ParseError::InvalidValue(
                "retry.step_timeout_ms",
                "must be nonzero".to_string(),
            ));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(ParseError::InvalidValue(
                "scheduler.max_attempts",
                "must be at least 1".to_string(),
            ));
        }
        let inv = &self.inventory;
        for (name, ratio) in [
            ("inventory.cpu_allocation_ratio", inv.cpu_allocation_ratio),
            ("inventory.ram_allocation_ratio", inv.ram_allocation_ratio),
            ("inventory.disk_allocation_ratio", inv.disk_allocation_ratio),
        ] {
            if !(ratio > 0.0) {
                return Err(ParseError::InvalidValue(name, ratio.to_string()));
            }
        }
        if self.lifecycle.max_batch_size == 0 {
            return Err(ParseError::InvalidValue(
                "lifecycle.max_batch_size",
                "must be at least 1".to_string(),
            ));
        }

        let mut cells = BTreeSet::new();
        for cell in &self.cells {
            if !cells.insert(cell.name.as_str()) {
                return Err(ParseError::Duplicate(
                    "cell",
                    cell.name.to_string(),
                ));
            }
        }
        for cell in &self.cells {
            if let Some(parent) = &cell.parent {
                if !cells.contains(parent.as_str()) {
                    return Err(ParseError::UnknownReference(
                        "cell",
                        cell.name.to_string(),
                        "parent cell",
                        parent.to_string(),
                    ));
                }
            }
        }

        let mut hosts = BTreeSet::new();
        for host in &self.hosts {
            if !hosts.insert(host.name.as_str()) {
                return Err(ParseError::Duplicate("host", host.name.clone()));
            }
            if !cells.contains(host.cell.as_str()) {
                return Err(ParseError::UnknownReference(
                    "host",
                    host.name.clone(),
                    "cell",
                    host.cell.to_string(),
                ));
            }
        }

        let mut aggregates = BTreeSet::new();
        for aggregate in &self.aggregates {
            if !aggregates.insert(aggregate.name.as_str()) {
                return Err(ParseError::Duplicate(
                    "aggregate",
                    aggregate.name.clone(),
                ));
            }
            for host in &aggregate.hosts {
                if !hosts.contains(host.as_str()) {
                    return Err(ParseError::UnknownReference(
                        "aggregate",
                        aggregate.name.clone(),
                        "host",
                        host.clone(),
                    ));
                }
            }
        }

        let mut addresses = BTreeSet::new();
        for pool in &self.floating_ip_pools {
            for address in &pool.addresses {
                if !addresses.insert(*address) {
                    return Err(ParseError::Duplicate(
                        "floating IP",
                        address.to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Parses and validates a TOML configuration string.
pub fn from_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    from_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = from_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.retry.max_attempts, 5);
        assert!(cfg.lifecycle.reclaim_instance_interval().is_none());
        assert_eq!(cfg.scheduler.default_availability_zone, "nova");
    }

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config {
            cells: vec![CellConfig {
                name: "top".parse().unwrap(),
                parent: None,
            }],
            hosts: vec![HostConfig {
                name: "h1".to_string(),
                cell: "top".parse().unwrap(),
                vcpus: 4,
                memory_mib: 8192,
                disk_gib: 100,
                capabilities: BTreeMap::new(),
            }],
            ..Default::default()
        };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn topology_is_parsed() {
        let cfg = from_str(
            r#"
            [retry]
            max_attempts = 2
            step_timeout_ms = 500

            [lifecycle]
            reclaim_instance_interval_secs = 30

            [[cell]]
            name = "region"

            [[cell]]
            name = "child"
            parent = "region"

            [[host]]
            name = "compute-1"
            cell = "child"
            vcpus = 8
            memory_mib = 16384
            disk_gib = 200
            capabilities = { hypervisor_type = "kvm" }

            [[aggregate]]
            name = "ssd"
            availability_zone = "az1"
            metadata = { ssd = "true" }
            hosts = ["compute-1"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.step_timeout(), Duration::from_millis(500));
        assert_eq!(
            cfg.lifecycle.reclaim_instance_interval(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(cfg.hosts[0].capacity(), Footprint::new(8, 16384, 200));
        assert_eq!(
            cfg.hosts[0].capabilities.get("hypervisor_type").unwrap(),
            "kvm"
        );
        assert_eq!(cfg.aggregates[0].availability_zone.as_deref(), Some("az1"));
    }

    #[test]
    fn sample_config_is_valid() {
        let cfg = from_str(include_str!(
            "../../../bin/corral-standalone/corral.toml"
        ))
        .unwrap();
        assert_eq!(cfg.hosts.len(), 3);
        assert_eq!(cfg.cells.len(), 3);
        assert_eq!(
            cfg.lifecycle.resize_confirm_window(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn floating_addresses_are_unique() {
        let cfg = from_str(
            r#"
            [[floating_ip_pool]]
            name = "public"
            addresses = ["192.0.2.10", "192.0.2.11"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.floating_ip_pools[0].addresses.len(), 2);

        let err = from_str(
            r#"
            [[floating_ip_pool]]
            name = "a"
            addresses = ["192.0.2.10"]

            [[floating_ip_pool]]
            name = "b"
            addresses = ["192.0.2.10"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Duplicate("floating IP", _)));
    }

    #[test]
    fn dangling_references_are_rejected() {
        let err = from_str(
            r#"
            [[host]]
            name = "compute-1"
            cell = "nowhere"
            vcpus = 1
            memory_mib = 1
            disk_gib = 1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::UnknownReference("host", ..)));

        let err = from_str(
            r#"
            [[aggregate]]
            name = "a"
            hosts = ["ghost"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::UnknownReference("aggregate", ..)));
    }

    #[test]
    fn invalid_retry_policy_is_rejected() {
        let err = from_str("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidValue("retry.max_attempts", _)
        ));

        let err = from_str("[retry]\nmultiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue("retry.multiplier", _)));
    }
}
