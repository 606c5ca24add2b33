// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The line protocol spoken on stdin and stdout.
//!
//! Each input line is one JSON request:
//!
//! ```text
//! {"request_id": "r1", "admin": false, "op": "stop", "instance": "<uuid>"}
//! ```
//!
//! `request_id` may be omitted, in which case a fresh one is generated.
//! Each request is answered with one line holding either `{"ok": ...}` or
//! `{"error": {"kind": ..., "detail": ...}}`.

use std::net::IpAddr;

use chrono::Utc;
use corral::coordinator::{CreateRequest, RequestContext};
use corral::instance::InstanceFilter;
use corral::{Coordinator, OrchestrationError};
use corral_types::{
    Footprint, HostUuid, ImageUuid, InstanceState, InstanceUuid, PortUuid,
    RebootKind, RequestId, VolumeUuid,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub request_id: Option<RequestId>,

    #[serde(default)]
    pub admin: bool,

    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Create(CreateRequest),
    Get { instance: InstanceUuid },
    List {
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        state: Option<InstanceState>,
        #[serde(default)]
        include_deleted: bool,
    },
    Actions { instance: InstanceUuid },
    ConsoleOutput {
        instance: InstanceUuid,
        #[serde(default)]
        length: Option<usize>,
    },

    Reboot { instance: InstanceUuid, kind: RebootKind },
    Stop { instance: InstanceUuid },
    Start { instance: InstanceUuid },
    Rescue {
        instance: InstanceUuid,
        #[serde(default)]
        image: Option<ImageUuid>,
    },
    Unrescue { instance: InstanceUuid },
    Pause { instance: InstanceUuid },
    Unpause { instance: InstanceUuid },
    Suspend { instance: InstanceUuid },
    Resume { instance: InstanceUuid },

    Resize { instance: InstanceUuid, footprint: Footprint },
    ConfirmResize { instance: InstanceUuid },
    RevertResize { instance: InstanceUuid },
    Migrate {
        instance: InstanceUuid,
        #[serde(default)]
        host: Option<String>,
    },
    LiveMigrate {
        instance: InstanceUuid,
        #[serde(default)]
        host: Option<String>,
    },
    Evacuate {
        instance: InstanceUuid,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        on_shared_storage: bool,
        #[serde(default)]
        admin_password: Option<String>,
    },
    Backup {
        instance: InstanceUuid,
        name: String,
        backup_type: String,
        rotation: u32,
    },

    Delete { instance: InstanceUuid },
    Restore { instance: InstanceUuid },
    ForceDelete { instance: InstanceUuid },

    Lock { instance: InstanceUuid },
    Unlock { instance: InstanceUuid },
    ResetState { instance: InstanceUuid, state: InstanceState },
    Cancel { instance: InstanceUuid, task_request_id: RequestId },

    AttachVolume {
        instance: InstanceUuid,
        volume: VolumeUuid,
        #[serde(default)]
        device: Option<String>,
    },
    DetachVolume { instance: InstanceUuid, volume: VolumeUuid },
    AttachInterface {
        instance: InstanceUuid,
        #[serde(default)]
        network: Option<String>,
        #[serde(default)]
        port: Option<PortUuid>,
    },
    DetachInterface { instance: InstanceUuid, port: PortUuid },
    AssociateFloatingIp {
        instance: InstanceUuid,
        address: IpAddr,
        #[serde(default)]
        fixed_ip: Option<IpAddr>,
    },
    DisassociateFloatingIp { instance: InstanceUuid, address: IpAddr },

    Hosts,
    Uptime { host: String },
    SetHostEnabled {
        host: String,
        enabled: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    SetMaintenance { host: String, maintenance: bool },
    SetForcedDown { host: String, down: bool },
    DrainHost { host: String },
    Maintenance,
}

impl Command {
    /// Host administration reaches past the lifecycle verbs, so it is only
    /// open to administrators.
    fn is_host_admin(&self) -> bool {
        matches!(
            self,
            Command::SetHostEnabled { .. }
                | Command::SetMaintenance { .. }
                | Command::SetForcedDown { .. }
                | Command::Maintenance
        )
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, OrchestrationError> {
    serde_json::to_value(value)
        .map_err(|e| OrchestrationError::Fatal(format!("encoding reply: {e}")))
}

fn host_named(
    coordinator: &Coordinator,
    name: &str,
) -> Result<HostUuid, OrchestrationError> {
    coordinator
        .inventory()
        .host_by_name(name)
        .ok_or_else(|| OrchestrationError::not_found(format!("host {name}")))
}

fn maybe_host(
    coordinator: &Coordinator,
    name: Option<String>,
) -> Result<Option<HostUuid>, OrchestrationError> {
    name.map(|n| host_named(coordinator, &n)).transpose()
}

/// Carries out one request and returns the reply line.
pub async fn handle(coordinator: &Coordinator, envelope: Envelope) -> Value {
    let request_id = envelope.request_id.unwrap_or_else(RequestId::generate);
    let ctx = if envelope.admin {
        RequestContext::admin(request_id.clone())
    } else {
        RequestContext::new(request_id.clone())
    };
    let result = if envelope.command.is_host_admin() && !ctx.is_admin {
        Err(OrchestrationError::validation(
            "host administration requires an administrator",
        ))
    } else {
        dispatch(coordinator, &ctx, envelope.command).await
    };
    match result {
        Ok(value) => json!({ "request_id": request_id, "ok": value }),
        Err(e) => json!({ "request_id": request_id, "error": e }),
    }
}

async fn dispatch(
    c: &Coordinator,
    ctx: &RequestContext,
    command: Command,
) -> Result<Value, OrchestrationError> {
    use Command::*;

    match command {
        Create(request) => to_value(c.create(ctx, request).await?),
        Get { instance } => to_value(c.get(instance)?),
        List { host, state, include_deleted } => {
            let filter = InstanceFilter {
                host: maybe_host(c, host)?,
                state,
                include_deleted,
                ..Default::default()
            };
            to_value(c.list(&filter))
        }
        Actions { instance } => to_value(c.actions(instance)?),
        ConsoleOutput { instance, length } => {
            to_value(c.console_output(instance, length).await?)
        }

        Reboot { instance, kind } => {
            to_value(c.reboot(ctx, instance, kind).await?)
        }
        Stop { instance } => to_value(c.stop(ctx, instance).await?),
        Start { instance } => to_value(c.start(ctx, instance).await?),
        Rescue { instance, image } => {
            to_value(c.rescue(ctx, instance, image).await?)
        }
        Unrescue { instance } => to_value(c.unrescue(ctx, instance).await?),
        Pause { instance } => to_value(c.pause(ctx, instance).await?),
        Unpause { instance } => to_value(c.unpause(ctx, instance).await?),
        Suspend { instance } => to_value(c.suspend(ctx, instance).await?),
        Resume { instance } => to_value(c.resume(ctx, instance).await?),

        Resize { instance, footprint } => {
            to_value(c.resize(ctx, instance, footprint).await?)
        }
        ConfirmResize { instance } => {
            to_value(c.confirm_resize(ctx, instance).await?)
        }
        RevertResize { instance } => {
            to_value(c.revert_resize(ctx, instance).await?)
        }
        Migrate { instance, host } => {
            let target = maybe_host(c, host)?;
            to_value(c.migrate(ctx, instance, target).await?)
        }
        LiveMigrate { instance, host } => {
            let target = maybe_host(c, host)?;
            to_value(c.live_migrate(ctx, instance, target).await?)
        }
        Evacuate { instance, host, on_shared_storage, admin_password } => {
            let target = maybe_host(c, host)?;
            let shared = on_shared_storage;
            let evacuation = c
                .evacuate(ctx, instance, target, shared, admin_password)
                .await?;
            to_value(evacuation)
        }
        Backup { instance, name, backup_type, rotation } => to_value(
            c.backup(ctx, instance, name, backup_type, rotation).await?,
        ),

        Delete { instance } => to_value(c.delete(ctx, instance).await?),
        Restore { instance } => to_value(c.restore(ctx, instance).await?),
        ForceDelete { instance } => {
            to_value(c.force_delete(ctx, instance).await?)
        }

        Lock { instance } => to_value(c.lock(ctx, instance).await?),
        Unlock { instance } => to_value(c.unlock(ctx, instance).await?),
        ResetState { instance, state } => {
            to_value(c.reset_state(ctx, instance, state).await?)
        }
        Cancel { instance, task_request_id } => {
            to_value(c.cancel(instance, &task_request_id)?)
        }

        AttachVolume { instance, volume, device } => {
            to_value(c.attach_volume(ctx, instance, volume, device).await?)
        }
        DetachVolume { instance, volume } => {
            to_value(c.detach_volume(ctx, instance, volume).await?)
        }
        AttachInterface { instance, network, port } => {
            to_value(c.attach_interface(ctx, instance, network, port).await?)
        }
        DetachInterface { instance, port } => {
            to_value(c.detach_interface(ctx, instance, port).await?)
        }
        AssociateFloatingIp { instance, address, fixed_ip } => to_value(
            c.associate_floating_ip(ctx, instance, address, fixed_ip).await?,
        ),
        DisassociateFloatingIp { instance, address } => {
            to_value(c.disassociate_floating_ip(ctx, instance, address).await?)
        }

        Hosts => to_value(c.inventory().hosts()),
        Uptime { host } => to_value(c.uptime(host_named(c, &host)?).await?),
        SetHostEnabled { host, enabled, reason } => {
            let id = host_named(c, &host)?;
            c.inventory().set_enabled(id, enabled, reason)?;
            to_value(c.inventory().host(id)?)
        }
        SetMaintenance { host, maintenance } => {
            let id = host_named(c, &host)?;
            c.inventory().set_maintenance(id, maintenance)?;
            to_value(c.inventory().host(id)?)
        }
        SetForcedDown { host, down } => {
            let id = host_named(c, &host)?;
            c.inventory().set_forced_down(id, down)?;
            to_value(c.inventory().host(id)?)
        }
        DrainHost { host } => {
            to_value(c.drain_host(ctx, host_named(c, &host)?).await?)
        }
        Maintenance => to_value(c.run_maintenance(Utc::now()).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_decode_from_one_line() {
        let line = r#"{"request_id": "r-1", "op": "resize",
            "instance": "c6c0ad0e-5f3b-4b7e-9f64-1e6c1a1f3b55",
            "footprint": {"vcpus": 2, "memory_mib": 2048, "disk_gib": 20}}"#;
        let envelope: Envelope = serde_json::from_str(line).unwrap();
        assert_eq!(envelope.request_id.unwrap().as_str(), "r-1");
        assert!(!envelope.admin);
        assert!(matches!(
            envelope.command,
            Command::Resize { footprint, .. }
                if footprint == Footprint::new(2, 2048, 20)
        ));

        let line = r#"{"admin": true, "op": "set_forced_down",
            "host": "h1", "down": true}"#;
        let envelope: Envelope = serde_json::from_str(line).unwrap();
        assert!(envelope.command.is_host_admin());
    }
}
