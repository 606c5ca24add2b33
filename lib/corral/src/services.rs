// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contracts for the services the coordinator drives but does not own.
//!
//! The coordinator holds each service as an `Arc<dyn Trait>`. Every call is
//! made through [`crate::retry::RetryPolicy`], which bounds it with a
//! timeout, so implementations need not enforce their own deadlines.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_types::{
    Footprint, HostUuid, ImageUuid, InstanceUuid, PortUuid, RebootKind,
    VolumeUuid,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Request failed: {0}")]
    Failed(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl ServiceError {
    /// Returns true for failures that may succeed if the call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Timeout(_) | ServiceError::Unavailable(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageMetadata {
    pub id: ImageUuid,
    pub name: String,
    pub min_memory_mib: u64,
    pub min_disk_gib: u64,

    /// Image properties such as `hypervisor_type`.
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackupImage {
    pub id: ImageUuid,
    pub instance: InstanceUuid,
    pub name: String,
    pub backup_type: String,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn get_image(&self, id: ImageUuid)
        -> Result<ImageMetadata, ServiceError>;

    async fn create_backup(
        &self,
        instance: InstanceUuid,
        name: String,
        backup_type: String,
    ) -> Result<ImageUuid, ServiceError>;

    /// Lists the backups of `instance` with the given type, oldest first.
    async fn list_backups(
        &self,
        instance: InstanceUuid,
        backup_type: String,
    ) -> Result<Vec<BackupImage>, ServiceError>;

    async fn delete_image(&self, id: ImageUuid) -> Result<(), ServiceError>;
}

/// How a host should connect to a volume. `driver_volume_type` selects the
/// connector in the [`crate::volume_drivers::VolumeDriverRegistry`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    pub data: BTreeMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Marks a volume as about to be attached so no one else can claim it.
    async fn reserve_volume(&self, volume: VolumeUuid)
        -> Result<(), ServiceError>;

    async fn unreserve_volume(
        &self,
        volume: VolumeUuid,
    ) -> Result<(), ServiceError>;

    async fn attach(
        &self,
        volume: VolumeUuid,
        instance: InstanceUuid,
        host: HostUuid,
        device: String,
    ) -> Result<ConnectionInfo, ServiceError>;

    async fn detach(
        &self,
        volume: VolumeUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn create_snapshot(
        &self,
        volume: VolumeUuid,
    ) -> Result<Uuid, ServiceError>;

    async fn delete_snapshot(&self, snapshot: Uuid) -> Result<(), ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub id: PortUuid,
    pub network: String,
    pub fixed_ip: IpAddr,
    pub mac_address: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn allocate_fixed_ip(
        &self,
        instance: InstanceUuid,
        network: Option<String>,
    ) -> Result<IpAddr, ServiceError>;

    async fn deallocate_fixed_ip(
        &self,
        instance: InstanceUuid,
        address: IpAddr,
    ) -> Result<(), ServiceError>;

    async fn associate_floating_ip(
        &self,
        address: IpAddr,
        instance: InstanceUuid,
        fixed_ip: IpAddr,
    ) -> Result<(), ServiceError>;

    async fn disassociate_floating_ip(
        &self,
        address: IpAddr,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn list_ports(
        &self,
        instance: InstanceUuid,
    ) -> Result<Vec<PortInfo>, ServiceError>;

    async fn attach_interface(
        &self,
        instance: InstanceUuid,
        host: HostUuid,
        network: Option<String>,
        port: Option<PortUuid>,
    ) -> Result<PortInfo, ServiceError>;

    async fn detach_interface(
        &self,
        instance: InstanceUuid,
        port: PortUuid,
    ) -> Result<(), ServiceError>;
}

/// The power state a host agent reports for an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Paused,
    Suspended,
    Shutdown,
    Rescued,
}

/// What a host agent knows about one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteInstance {
    pub power: PowerState,
    pub footprint: Footprint,
}

/// The per-host hypervisor agent. Every call names the host it is routed to.
///
/// `migrate`, `live_migrate`, and `rebuild` are not idempotent: repeating one
/// after an ambiguous failure may start a second copy. Callers confirm the
/// outcome with `instance_state` instead of retrying them blindly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostAgent: Send + Sync {
    async fn spawn(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        footprint: Footprint,
        image: ImageUuid,
        admin_password: Option<String>,
    ) -> Result<(), ServiceError>;

    async fn destroy(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn reboot(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        kind: RebootKind,
    ) -> Result<(), ServiceError>;

    async fn power_off(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn power_on(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn rescue(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        image: ImageUuid,
    ) -> Result<(), ServiceError>;

    async fn unrescue(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn pause(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn unpause(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn suspend(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn resume(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    /// Copies the instance to `target` with a new footprint, leaving the
    /// source copy in place until the migration is confirmed or reverted.
    async fn migrate(
        &self,
        source: HostUuid,
        target: HostUuid,
        instance: InstanceUuid,
        footprint: Footprint,
    ) -> Result<(), ServiceError>;

    /// Discards the source copy of a migrated instance.
    async fn confirm_migration(
        &self,
        source: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    /// Discards the target copy and restores the source copy.
    async fn revert_migration(
        &self,
        source: HostUuid,
        target: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    async fn live_migrate(
        &self,
        source: HostUuid,
        target: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError>;

    /// Recreates the instance on `host` from its image (or from shared
    /// storage when `on_shared_storage`).
    async fn rebuild(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        footprint: Footprint,
        image: ImageUuid,
        on_shared_storage: bool,
        admin_password: Option<String>,
    ) -> Result<(), ServiceError>;

    /// Reports the instance as the host sees it, or `None` if the host has
    /// no copy of it.
    async fn instance_state(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<Option<RemoteInstance>, ServiceError>;

    async fn get_console_output(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        length: Option<usize>,
    ) -> Result<String, ServiceError>;

    async fn get_uptime(&self, host: HostUuid) -> Result<String, ServiceError>;
}

/// The full set of external collaborators.
#[derive(Clone)]
pub struct Services {
    pub images: std::sync::Arc<dyn ImageService>,
    pub volumes: std::sync::Arc<dyn VolumeService>,
    pub network: std::sync::Arc<dyn NetworkService>,
    pub agent: std::sync::Arc<dyn HostAgent>,
}
