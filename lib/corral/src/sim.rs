// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the external services.
//!
//! [`SimServices`] implements every service contract against a single table
//! of simulated state: guests on hosts, volumes, ports, and images. It backs
//! the standalone binary and the test suites. Faults can be injected per call
//! name, either before the call takes effect or after it, so that ambiguous
//! failures can be exercised.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use corral_types::{
    Footprint, GenericUuid, HostUuid, ImageUuid, InstanceUuid, PortUuid,
    RebootKind, VolumeUuid,
};
use slog::{debug, info, Logger};
use uuid::Uuid;

use crate::services::{
    BackupImage, ConnectionInfo, HostAgent, ImageMetadata, ImageService,
    NetworkService, PortInfo, PowerState, RemoteInstance, ServiceError,
    Services, VolumeService,
};

const DEFAULT_NETWORK: &str = "private";

/// A fault armed for one call name.
#[derive(Clone, Debug)]
struct Fault {
    err: ServiceError,

    /// Calls to let through before the fault fires.
    skip: usize,

    /// Calls the fault still fails.
    remaining: usize,

    /// Whether the call's effect is applied before the error is returned.
    after_effect: bool,
}

#[derive(Clone, Debug)]
struct SimVolume {
    driver: String,
    reserved: bool,
    attached_to: Option<InstanceUuid>,
}

/// The source copy kept while a cold migration awaits confirmation.
#[derive(Clone, Copy, Debug)]
struct PendingMigration {
    source: HostUuid,
    target: HostUuid,
    original: RemoteInstance,
}

#[derive(Default)]
struct SimState {
    images: BTreeMap<ImageUuid, ImageMetadata>,
    backups: Vec<BackupImage>,
    volumes: BTreeMap<VolumeUuid, SimVolume>,
    snapshots: BTreeSet<Uuid>,
    guests: BTreeMap<(HostUuid, InstanceUuid), RemoteInstance>,
    migrations: BTreeMap<InstanceUuid, PendingMigration>,
    ports: BTreeMap<PortUuid, (InstanceUuid, PortInfo)>,
    fixed_ips: BTreeMap<IpAddr, InstanceUuid>,
    floating_ips: BTreeMap<IpAddr, InstanceUuid>,
    next_address: u32,
    calls: BTreeMap<&'static str, usize>,
    faults: BTreeMap<&'static str, Fault>,
}

impl SimState {
    /// Counts a call and consumes the fault armed for it, if one fires.
    fn enter(&mut self, op: &'static str) -> Option<Fault> {
        *self.calls.entry(op).or_default() += 1;
        let fault = self.faults.get_mut(op)?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        let fired = fault.clone();
        fault.remaining -= 1;
        if fault.remaining == 0 {
            self.faults.remove(op);
        }
        Some(fired)
    }

    fn next_address(&mut self) -> IpAddr {
        self.next_address += 1;
        let n = self.next_address;
        IpAddr::V4(Ipv4Addr::new(10, 0, (n >> 8) as u8, (n & 0xff) as u8))
    }

    fn guest_mut(
        &mut self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<&mut RemoteInstance, ServiceError> {
        self.guests.get_mut(&(host, instance)).ok_or_else(|| {
            ServiceError::NotFound(format!("instance {instance} on {host}"))
        })
    }

    fn set_power(
        &mut self,
        host: HostUuid,
        instance: InstanceUuid,
        power: PowerState,
    ) -> Result<(), ServiceError> {
        self.guest_mut(host, instance)?.power = power;
        Ok(())
    }
}

fn connection_data(
    driver: &str,
    volume: VolumeUuid,
) -> BTreeMap<String, String> {
    let fields: Vec<(&str, String)> = match driver {
        "iscsi" => vec![
            ("target_portal", "192.0.2.10:3260".to_string()),
            ("target_iqn", format!("iqn.2010-10.org.corral:volume-{volume}")),
            ("target_lun", "1".to_string()),
        ],
        "nfs" => vec![("export", format!("192.0.2.20:/srv/volumes/{volume}"))],
        "rbd" => vec![("name", format!("volumes/volume-{volume}"))],
        "local" => vec![("device_path", format!("/dev/disk/by-id/{volume}"))],
        _ => Vec::new(),
    };
    fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

pub struct SimServices {
    state: Mutex<SimState>,
    log: Logger,
}

impl SimServices {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(SimState::default()), log })
    }

    /// Hands out the simulator behind every service contract.
    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            images: self.clone(),
            volumes: self.clone(),
            network: self.clone(),
            agent: self.clone(),
        }
    }

    /// Runs `f` as the call `op`, honoring any fault armed for it.
    fn call<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut SimState) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let mut state = self.state.lock().unwrap();
        let fault = state.enter(op);
        if let Some(fault) = &fault {
            if !fault.after_effect {
                debug!(self.log, "injected fault"; "call" => op);
                return Err(fault.err.clone());
            }
        }
        let out = f(&mut state)?;
        match fault {
            Some(fault) => {
                debug!(self.log, "injected fault after effect"; "call" => op);
                Err(fault.err)
            }
            None => Ok(out),
        }
    }

    fn arm(&self, op: &'static str, fault: Fault) {
        let mut state = self.state.lock().unwrap();
        if fault.remaining == 0 {
            state.faults.remove(op);
        } else {
            state.faults.insert(op, fault);
        }
    }

    // Fault injection

    /// Fails the next `times` calls to `op` without any effect.
    pub fn inject(&self, op: &'static str, err: ServiceError, times: usize) {
        let fault =
            Fault { err, skip: 0, remaining: times, after_effect: false };
        self.arm(op, fault);
    }

    /// Applies the next `times` calls to `op` but reports them as failed.
    pub fn inject_after_effect(
        &self,
        op: &'static str,
        err: ServiceError,
        times: usize,
    ) {
        let fault =
            Fault { err, skip: 0, remaining: times, after_effect: true };
        self.arm(op, fault);
    }

    /// Lets `successes` calls to `op` through, then fails the one after.
    pub fn inject_after(
        &self,
        op: &'static str,
        successes: usize,
        err: ServiceError,
    ) {
        self.arm(
            op,
            Fault { err, skip: successes, remaining: 1, after_effect: false },
        );
    }

    // Seeding and inspection

    /// Registers an image without minimum requirements.
    pub fn add_image(&self, name: &str) -> ImageUuid {
        let id = ImageUuid::new_v4();
        self.state.lock().unwrap().images.insert(
            id,
            ImageMetadata {
                id,
                name: name.to_string(),
                min_memory_mib: 0,
                min_disk_gib: 0,
                properties: BTreeMap::new(),
            },
        );
        id
    }

    /// Registers a volume served through the named driver.
    pub fn add_volume(&self, driver: &str) -> VolumeUuid {
        let id = VolumeUuid::new_v4();
        self.state.lock().unwrap().volumes.insert(
            id,
            SimVolume {
                driver: driver.to_string(),
                reserved: false,
                attached_to: None,
            },
        );
        id
    }

    /// Puts a running guest on `host` directly, as if an earlier spawn had
    /// landed.
    pub fn place_guest(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        footprint: Footprint,
    ) {
        self.state.lock().unwrap().guests.insert(
            (host, instance),
            RemoteInstance { power: PowerState::Running, footprint },
        );
    }

    /// The number of times `op` was called, failed calls included.
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().unwrap().calls.get(op).copied().unwrap_or(0)
    }

    pub fn guest(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Option<RemoteInstance> {
        self.state.lock().unwrap().guests.get(&(host, instance)).copied()
    }

    /// Backups of `instance` of every type, oldest first.
    pub fn backups(&self, instance: InstanceUuid) -> Vec<BackupImage> {
        let state = self.state.lock().unwrap();
        state
            .backups
            .iter()
            .filter(|b| b.instance == instance)
            .cloned()
            .collect()
    }

    pub fn volume_attached(&self, volume: VolumeUuid) -> bool {
        let state = self.state.lock().unwrap();
        state.volumes.get(&volume).is_some_and(|v| v.attached_to.is_some())
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots.len()
    }
}

#[async_trait]
impl ImageService for SimServices {
    async fn get_image(
        &self,
        id: ImageUuid,
    ) -> Result<ImageMetadata, ServiceError> {
        self.call("get_image", |s| {
            s.images
                .get(&id)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(format!("image {id}")))
        })
    }

    async fn create_backup(
        &self,
        instance: InstanceUuid,
        name: String,
        backup_type: String,
    ) -> Result<ImageUuid, ServiceError> {
        self.call("create_backup", |s| {
            let id = ImageUuid::new_v4();
            s.backups.push(BackupImage {
                id,
                instance,
                name,
                backup_type,
                created_at: Utc::now(),
            });
            Ok(id)
        })
    }

    async fn list_backups(
        &self,
        instance: InstanceUuid,
        backup_type: String,
    ) -> Result<Vec<BackupImage>, ServiceError> {
        self.call("list_backups", |s| {
            Ok(s.backups
                .iter()
                .filter(|b| b.instance == instance)
                .filter(|b| b.backup_type == backup_type)
                .cloned()
                .collect())
        })
    }

    async fn delete_image(&self, id: ImageUuid) -> Result<(), ServiceError> {
        self.call("delete_image", |s| {
            s.backups.retain(|b| b.id != id);
            s.images.remove(&id);
            Ok(())
        })
    }
}

#[async_trait]
impl VolumeService for SimServices {
    async fn reserve_volume(
        &self,
        volume: VolumeUuid,
    ) -> Result<(), ServiceError> {
        self.call("reserve_volume", |s| {
            let v = s.volumes.get_mut(&volume).ok_or_else(|| {
                ServiceError::NotFound(format!("volume {volume}"))
            })?;
            if v.attached_to.is_some() {
                return Err(ServiceError::Failed(format!(
                    "volume {volume} is in use"
                )));
            }
            v.reserved = true;
            Ok(())
        })
    }

    async fn unreserve_volume(
        &self,
        volume: VolumeUuid,
    ) -> Result<(), ServiceError> {
        self.call("unreserve_volume", |s| {
            if let Some(v) = s.volumes.get_mut(&volume) {
                v.reserved = false;
            }
            Ok(())
        })
    }

    async fn attach(
        &self,
        volume: VolumeUuid,
        instance: InstanceUuid,
        _host: HostUuid,
        _device: String,
    ) -> Result<ConnectionInfo, ServiceError> {
        self.call("attach", |s| {
            let v = s.volumes.get_mut(&volume).ok_or_else(|| {
                ServiceError::NotFound(format!("volume {volume}"))
            })?;
            match v.attached_to {
                Some(owner) if owner != instance => {
                    return Err(ServiceError::Failed(format!(
                        "volume {volume} is attached to {owner}"
                    )));
                }
                _ => {}
            }
            v.reserved = false;
            v.attached_to = Some(instance);
            Ok(ConnectionInfo {
                driver_volume_type: v.driver.clone(),
                data: connection_data(&v.driver, volume),
            })
        })
    }

    async fn detach(
        &self,
        volume: VolumeUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("detach", |s| {
            if let Some(v) = s.volumes.get_mut(&volume) {
                if v.attached_to == Some(instance) {
                    v.attached_to = None;
                }
            }
            Ok(())
        })
    }

    async fn create_snapshot(
        &self,
        volume: VolumeUuid,
    ) -> Result<Uuid, ServiceError> {
        self.call("create_snapshot", |s| {
            if !s.volumes.contains_key(&volume) {
                return Err(ServiceError::NotFound(format!("volume {volume}")));
            }
            let id = Uuid::new_v4();
            s.snapshots.insert(id);
            Ok(id)
        })
    }

    async fn delete_snapshot(
        &self,
        snapshot: Uuid,
    ) -> Result<(), ServiceError> {
        self.call("delete_snapshot", |s| {
            s.snapshots.remove(&snapshot);
            Ok(())
        })
    }
}

#[async_trait]
impl NetworkService for SimServices {
    async fn allocate_fixed_ip(
        &self,
        instance: InstanceUuid,
        _network: Option<String>,
    ) -> Result<IpAddr, ServiceError> {
        self.call("allocate_fixed_ip", |s| {
            let address = s.next_address();
            s.fixed_ips.insert(address, instance);
            Ok(address)
        })
    }

    async fn deallocate_fixed_ip(
        &self,
        instance: InstanceUuid,
        address: IpAddr,
    ) -> Result<(), ServiceError> {
        self.call("deallocate_fixed_ip", |s| {
            if s.fixed_ips.get(&address) == Some(&instance) {
                s.fixed_ips.remove(&address);
            }
            Ok(())
        })
    }

    async fn associate_floating_ip(
        &self,
        address: IpAddr,
        instance: InstanceUuid,
        _fixed_ip: IpAddr,
    ) -> Result<(), ServiceError> {
        self.call("associate_floating_ip", |s| {
            s.floating_ips.insert(address, instance);
            Ok(())
        })
    }

    async fn disassociate_floating_ip(
        &self,
        address: IpAddr,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("disassociate_floating_ip", |s| {
            if s.floating_ips.get(&address) == Some(&instance) {
                s.floating_ips.remove(&address);
            }
            Ok(())
        })
    }

    async fn list_ports(
        &self,
        instance: InstanceUuid,
    ) -> Result<Vec<PortInfo>, ServiceError> {
        self.call("list_ports", |s| {
            Ok(s.ports
                .values()
                .filter(|(owner, _)| *owner == instance)
                .map(|(_, port)| port.clone())
                .collect())
        })
    }

    async fn attach_interface(
        &self,
        instance: InstanceUuid,
        _host: HostUuid,
        network: Option<String>,
        port: Option<PortUuid>,
    ) -> Result<PortInfo, ServiceError> {
        self.call("attach_interface", |s| {
            if let Some((owner, existing)) =
                port.and_then(|p| s.ports.get(&p)).cloned()
            {
                if owner != instance {
                    return Err(ServiceError::Failed(format!(
                        "port {} is bound to {owner}",
                        existing.id
                    )));
                }
                return Ok(existing);
            }
            let id = port.unwrap_or_else(PortUuid::new_v4);
            let fixed_ip = s.next_address();
            let bytes = id.as_untyped_uuid().as_bytes();
            let info = PortInfo {
                id,
                network: network
                    .unwrap_or_else(|| DEFAULT_NETWORK.to_string()),
                fixed_ip,
                mac_address: format!(
                    "fa:16:3e:{:02x}:{:02x}:{:02x}",
                    bytes[0], bytes[1], bytes[2]
                ),
            };
            s.fixed_ips.insert(fixed_ip, instance);
            s.ports.insert(id, (instance, info.clone()));
            Ok(info)
        })
    }

    async fn detach_interface(
        &self,
        instance: InstanceUuid,
        port: PortUuid,
    ) -> Result<(), ServiceError> {
        self.call("detach_interface", |s| {
            let ours = s.ports.get(&port).is_some_and(|(o, _)| *o == instance);
            if ours {
                if let Some((_, info)) = s.ports.remove(&port) {
                    s.fixed_ips.remove(&info.fixed_ip);
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl HostAgent for SimServices {
    async fn spawn(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        footprint: Footprint,
        image: ImageUuid,
        _admin_password: Option<String>,
    ) -> Result<(), ServiceError> {
        self.call("spawn", |s| {
            s.guests.insert(
                (host, instance),
                RemoteInstance { power: PowerState::Running, footprint },
            );
            info!(self.log, "spawned guest";
                  "host" => %host,
                  "instance" => %instance,
                  "image" => %image);
            Ok(())
        })
    }

    async fn destroy(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("destroy", |s| {
            s.guests.remove(&(host, instance));
            if s.migrations.get(&instance).is_some_and(|m| m.target == host) {
                s.migrations.remove(&instance);
            }
            Ok(())
        })
    }

    async fn reboot(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        _kind: RebootKind,
    ) -> Result<(), ServiceError> {
        self.call("reboot", |s| {
            s.set_power(host, instance, PowerState::Running)
        })
    }

    async fn power_off(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("power_off", |s| {
            s.set_power(host, instance, PowerState::Shutdown)
        })
    }

    async fn power_on(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("power_on", |s| {
            s.set_power(host, instance, PowerState::Running)
        })
    }

    async fn rescue(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        _image: ImageUuid,
    ) -> Result<(), ServiceError> {
        self.call("rescue", |s| {
            s.set_power(host, instance, PowerState::Rescued)
        })
    }

    async fn unrescue(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("unrescue", |s| {
            s.set_power(host, instance, PowerState::Running)
        })
    }

    async fn pause(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("pause", |s| s.set_power(host, instance, PowerState::Paused))
    }

    async fn unpause(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("unpause", |s| {
            s.set_power(host, instance, PowerState::Running)
        })
    }

    async fn suspend(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("suspend", |s| {
            s.set_power(host, instance, PowerState::Suspended)
        })
    }

    async fn resume(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("resume", |s| {
            s.set_power(host, instance, PowerState::Running)
        })
    }

    async fn migrate(
        &self,
        source: HostUuid,
        target: HostUuid,
        instance: InstanceUuid,
        footprint: Footprint,
    ) -> Result<(), ServiceError> {
        self.call("migrate", |s| {
            let original = *s.guest_mut(source, instance)?;
            s.migrations.insert(
                instance,
                PendingMigration { source, target, original },
            );
            s.guests.insert(
                (target, instance),
                RemoteInstance { power: original.power, footprint },
            );
            Ok(())
        })
    }

    async fn confirm_migration(
        &self,
        source: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("confirm_migration", |s| {
            if let Some(pending) = s.migrations.remove(&instance) {
                if pending.target != source {
                    s.guests.remove(&(source, instance));
                }
            }
            Ok(())
        })
    }

    async fn revert_migration(
        &self,
        source: HostUuid,
        target: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("revert_migration", |s| {
            let Some(pending) = s.migrations.remove(&instance) else {
                return Ok(());
            };
            if target != source {
                s.guests.remove(&(target, instance));
            }
            s.guests.insert((pending.source, instance), pending.original);
            Ok(())
        })
    }

    async fn live_migrate(
        &self,
        source: HostUuid,
        target: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        self.call("live_migrate", |s| {
            let guest = *s.guest_mut(source, instance)?;
            s.guests.remove(&(source, instance));
            s.guests.insert((target, instance), guest);
            Ok(())
        })
    }

    async fn rebuild(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        footprint: Footprint,
        _image: ImageUuid,
        _on_shared_storage: bool,
        _admin_password: Option<String>,
    ) -> Result<(), ServiceError> {
        self.call("rebuild", |s| {
            s.guests.insert(
                (host, instance),
                RemoteInstance { power: PowerState::Running, footprint },
            );
            Ok(())
        })
    }

    async fn instance_state(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<Option<RemoteInstance>, ServiceError> {
        self.call("instance_state", |s| {
            Ok(s.guests.get(&(host, instance)).copied())
        })
    }

    async fn get_console_output(
        &self,
        host: HostUuid,
        instance: InstanceUuid,
        length: Option<usize>,
    ) -> Result<String, ServiceError> {
        self.call("get_console_output", |s| {
            let guest = s.guest_mut(host, instance)?;
            let lines: Vec<String> = [
                format!("instance {instance} booted on {host}"),
                format!("power state: {:?}", guest.power),
                format!("vcpus: {}", guest.footprint.vcpus),
            ]
            .into_iter()
            .collect();
            let keep = length.unwrap_or(lines.len()).min(lines.len());
            Ok(lines[lines.len() - keep..].join("\n"))
        })
    }

    async fn get_uptime(&self, host: HostUuid) -> Result<String, ServiceError> {
        self.call("get_uptime", |s| {
            let guests = s.guests.keys().filter(|(h, _)| *h == host).count();
            Ok(format!("host {host} up, {guests} guests"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> Arc<SimServices> {
        SimServices::new(Logger::root(slog::Discard, slog::o!()))
    }

    #[tokio::test]
    async fn faults_fire_in_order() {
        let sim = sim();
        let (host, id) = (HostUuid::new_v4(), InstanceUuid::new_v4());
        let fp = Footprint::new(1, 512, 1);
        let image = ImageUuid::new_v4();

        sim.inject_after("spawn", 1, ServiceError::Failed("once".into()));
        assert!(sim.spawn(host, id, fp, image, None).await.is_ok());
        assert!(sim.spawn(host, id, fp, image, None).await.is_err());
        assert!(sim.spawn(host, id, fp, image, None).await.is_ok());
        assert_eq!(sim.calls("spawn"), 3);

        sim.inject_after_effect(
            "destroy",
            ServiceError::Unavailable("lost".into()),
            1,
        );
        assert!(sim.destroy(host, id).await.is_err());
        assert!(sim.guest(host, id).is_none());
    }

    #[tokio::test]
    async fn reverted_migrations_restore_the_source() {
        let sim = sim();
        let (source, target) = (HostUuid::new_v4(), HostUuid::new_v4());
        let id = InstanceUuid::new_v4();
        let small = Footprint::new(1, 512, 1);
        sim.place_guest(source, id, small);

        sim.migrate(source, target, id, Footprint::new(2, 1024, 2))
            .await
            .unwrap();
        assert!(sim.guest(target, id).is_some());
        sim.revert_migration(source, target, id).await.unwrap();
        assert!(sim.guest(target, id).is_none());
        assert_eq!(sim.guest(source, id).unwrap().footprint, small);

        // Nothing pending: a repeated revert changes nothing.
        sim.revert_migration(source, target, id).await.unwrap();
        assert_eq!(sim.guest(source, id).unwrap().footprint, small);
    }
}
