// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volumes, network interfaces, and floating addresses.
//!
//! Attachment verbs never move the instance out of its current state. A
//! failure undoes whatever part of the attachment was made and leaves the
//! instance as it was.

use std::collections::BTreeSet;
use std::net::IpAddr;

use corral_types::{ActionKind, InstanceUuid, PortUuid, VolumeUuid};
use slog::{info, warn};

use super::{Coordinator, Outcome, RequestContext, Rollback, Task};
use crate::error::OrchestrationError;
use crate::instance::{InstanceRecord, InstanceView, TaskStep, VolumeAttachment};

/// Picks the first unused `/dev/vdX` name, skipping the root disk.
fn next_device(record: &InstanceRecord) -> Option<String> {
    let used: BTreeSet<&str> =
        record.volumes.values().map(|a| a.device.as_str()).collect();
    (b'b'..=b'z')
        .map(|c| format!("/dev/vd{}", c as char))
        .find(|device| !used.contains(device.as_str()))
}

impl Coordinator {
    /// Takes the task marker for an attachment verb and moves it to
    /// `Executing`, unless `check` finds a reason not to proceed.
    fn begin_attachment<T>(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        action: ActionKind,
        check: impl FnOnce(&Task) -> Result<T, OrchestrationError>,
    ) -> Result<(Task, T), OrchestrationError> {
        let task = self.begin(ctx, id, action, self.plan_context(ctx))?;
        let checked = match check(&task) {
            Ok(checked) => checked,
            Err(e) => return Err(self.fail(&task, e, Rollback::Restore)),
        };
        if self.cancel_requested(&task) {
            return Err(self.abort(&task));
        }
        self.set_step(&task, TaskStep::Executing, None)
            .map_err(|e| self.fail(&task, e, Rollback::Restore))?;
        Ok((task, checked))
    }

    pub async fn attach_volume(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        volume: VolumeUuid,
        device: Option<String>,
    ) -> Result<InstanceView, OrchestrationError> {
        if let Some(device) = &device {
            if !device.starts_with("/dev/") || device.len() <= "/dev/".len() {
                return Err(OrchestrationError::validation(format!(
                    "device name {device:?} is not under /dev/"
                )));
            }
        }
        self.run(ctx, ActionKind::AttachVolume, Some(id), async {
            let (task, (host, device)) =
                self.begin_attachment(ctx, id, ActionKind::AttachVolume, |t| {
                    let host = t.host()?;
                    let record = &t.record;
                    if record.volumes.contains_key(&volume) {
                        return Err(OrchestrationError::Conflict(format!(
                            "volume {volume} is already attached"
                        )));
                    }
                    let in_use = |d: &String| {
                        record.volumes.values().any(|a| &a.device == d)
                    };
                    let device = match device.clone() {
                        Some(d) if in_use(&d) => {
                            return Err(OrchestrationError::Conflict(format!(
                                "device {d} is already in use"
                            )));
                        }
                        Some(d) => d,
                        None => next_device(record).ok_or_else(|| {
                            OrchestrationError::Conflict(
                                "no free device names left".to_string(),
                            )
                        })?,
                    };
                    Ok((host, device))
                })?;

            let volumes = &self.services.volumes;
            let reserved = self
                .event(
                    &task,
                    "reserve_volume",
                    self.retry.idempotent(&task.log, "reserve_volume", || {
                        volumes.reserve_volume(volume)
                    }),
                )
                .await;
            if let Err(e) = reserved {
                return Err(self.fail(&task, e.into(), Rollback::Restore));
            }

            let attached = self
                .event(
                    &task,
                    "attach_volume",
                    self.retry.idempotent(&task.log, "attach_volume", || {
                        volumes.attach(volume, id, host, device.clone())
                    }),
                )
                .await;
            let info = match attached {
                Ok(info) => info,
                Err(e) => {
                    self.best_effort(
                        &task,
                        "unreserve_volume",
                        self.retry.once(volumes.unreserve_volume(volume)),
                    )
                    .await;
                    return Err(self.fail(&task, e.into(), Rollback::Restore));
                }
            };

            if let Err(e) = self.volume_drivers.connect(&info) {
                self.best_effort(
                    &task,
                    "detach_volume",
                    self.retry.once(volumes.detach(volume, id)),
                )
                .await;
                return Err(self.fail(&task, e.into(), Rollback::Restore));
            }

            info!(task.log, "volume attached";
                  "volume" => %volume,
                  "device" => &device,
                  "driver" => &info.driver_volume_type);
            self.complete(&task, |r| {
                r.volumes.insert(
                    volume,
                    VolumeAttachment {
                        volume,
                        device,
                        driver_volume_type: info.driver_volume_type,
                    },
                );
            })
            .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    pub async fn detach_volume(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        volume: VolumeUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::DetachVolume, Some(id), async {
            let (task, ()) =
                self.begin_attachment(ctx, id, ActionKind::DetachVolume, |t| {
                    if t.record.volumes.contains_key(&volume) {
                        Ok(())
                    } else {
                        Err(OrchestrationError::not_found(format!(
                            "volume {volume} on instance {id}"
                        )))
                    }
                })?;

            let volumes = &self.services.volumes;
            let detached = self
                .event(
                    &task,
                    "detach_volume",
                    self.retry.idempotent(&task.log, "detach_volume", || {
                        volumes.detach(volume, id)
                    }),
                )
                .await;
            if let Err(e) = detached {
                return Err(self.fail(&task, e.into(), Rollback::Restore));
            }
            self.complete(&task, |r| {
                r.volumes.remove(&volume);
            })
            .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    /// Plugs a new port into the instance, on `network` or from an existing
    /// `port`.
    pub async fn attach_interface(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        network: Option<String>,
        port: Option<PortUuid>,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::AttachInterface, Some(id), async {
            let (task, host) = self.begin_attachment(
                ctx,
                id,
                ActionKind::AttachInterface,
                |t| {
                    let host = t.host()?;
                    match port {
                        Some(port) if t.record.ports.contains_key(&port) => {
                            Err(OrchestrationError::Conflict(format!(
                                "port {port} is already attached"
                            )))
                        }
                        _ => Ok(host),
                    }
                },
            )?;

            // Creating a port is not safe to repeat, so it gets one try.
            let service = &self.services.network;
            let attached = self
                .event(
                    &task,
                    "attach_interface",
                    self.retry.once(service.attach_interface(
                        id,
                        host,
                        network.clone(),
                        port,
                    )),
                )
                .await;
            let info = match attached {
                Ok(info) => info,
                Err(e) => {
                    return Err(self.fail(&task, e.into(), Rollback::Restore))
                }
            };
            info!(task.log, "interface attached";
                  "port" => %info.id,
                  "network" => &info.network,
                  "address" => %info.fixed_ip);
            self.complete(&task, |r| {
                r.ports.insert(info.id, info.fixed_ip);
                if !r.fixed_ips.contains(&info.fixed_ip) {
                    r.fixed_ips.push(info.fixed_ip);
                }
            })
            .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    pub async fn detach_interface(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        port: PortUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::DetachInterface, Some(id), async {
            let (task, address) = self.begin_attachment(
                ctx,
                id,
                ActionKind::DetachInterface,
                |t| {
                    t.record.ports.get(&port).copied().ok_or_else(|| {
                        OrchestrationError::not_found(format!(
                            "port {port} on instance {id}"
                        ))
                    })
                },
            )?;

            let service = &self.services.network;
            let detached = self
                .event(
                    &task,
                    "detach_interface",
                    self.retry.idempotent(&task.log, "detach_interface", || {
                        service.detach_interface(id, port)
                    }),
                )
                .await;
            if let Err(e) = detached {
                return Err(self.fail(&task, e.into(), Rollback::Restore));
            }
            self.complete(&task, |r| {
                r.ports.remove(&port);
                r.fixed_ips.retain(|ip| *ip != address);
            })
            .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    /// Associates a floating address with one of the instance's fixed
    /// addresses (the first one unless `fixed_ip` names another).
    pub async fn associate_floating_ip(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        address: IpAddr,
        fixed_ip: Option<IpAddr>,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::AssociateFloatingIp, Some(id), async {
            let (task, (fixed_ip, newly_claimed)) = self.begin_attachment(
                ctx,
                id,
                ActionKind::AssociateFloatingIp,
                |t| {
                    let fixed_ip = match fixed_ip {
                        Some(ip) if t.record.fixed_ips.contains(&ip) => ip,
                        Some(ip) => {
                            return Err(OrchestrationError::validation(
                                format!("{ip} is not an address of {id}"),
                            ))
                        }
                        None => {
                            t.record.fixed_ips.first().copied().ok_or_else(
                                || {
                                    OrchestrationError::validation(format!(
                                        "instance {id} has no fixed address"
                                    ))
                                },
                            )?
                        }
                    };
                    let newly_claimed = self.floating_ips.claim(address, id)?;
                    Ok((fixed_ip, newly_claimed))
                },
            )?;

            let service = &self.services.network;
            let associated = self
                .event(
                    &task,
                    "associate_floating_ip",
                    self.retry.idempotent(
                        &task.log,
                        "associate_floating_ip",
                        || service.associate_floating_ip(address, id, fixed_ip),
                    ),
                )
                .await;
            if let Err(e) = associated {
                if newly_claimed {
                    let _ = self.floating_ips.unclaim(address, id);
                }
                return Err(self.fail(&task, e.into(), Rollback::Restore));
            }
            self.complete(&task, |r| {
                r.floating_ips.insert(address);
            })
            .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    pub async fn disassociate_floating_ip(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        address: IpAddr,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::DisassociateFloatingIp, Some(id), async {
            let (task, ()) = self.begin_attachment(
                ctx,
                id,
                ActionKind::DisassociateFloatingIp,
                |t| {
                    if t.record.floating_ips.contains(&address) {
                        Ok(())
                    } else {
                        Err(OrchestrationError::not_found(format!(
                            "floating address {address} on instance {id}"
                        )))
                    }
                },
            )?;

            let service = &self.services.network;
            let disassociated = self
                .event(
                    &task,
                    "disassociate_floating_ip",
                    self.retry.idempotent(
                        &task.log,
                        "disassociate_floating_ip",
                        || service.disassociate_floating_ip(address, id),
                    ),
                )
                .await;
            if let Err(e) = disassociated {
                return Err(self.fail(&task, e.into(), Rollback::Restore));
            }
            if let Err(e) = self.floating_ips.unclaim(address, id) {
                warn!(task.log, "floating address was not claimed";
                      "address" => %address,
                      "error" => %e);
            }
            self.complete(&task, |r| {
                r.floating_ips.remove(&address);
            })
            .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }
}
