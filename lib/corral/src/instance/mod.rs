// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance records and the task marker that serializes work on them.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use corral_types::{
    ActionKind, CellName, Footprint, HostUuid, ImageUuid, InstanceState,
    InstanceUuid, LockedBy, PortUuid, ReservationUuid, RequestId, VolumeUuid,
};
use serde::Serialize;

pub mod state_machine;
pub mod store;

pub use state_machine::{plan, DenyReason, Plan, PlanContext};
pub use store::{InstanceFilter, InstanceStore};

/// The step a multi-step task has reached. The step is stored with the task
/// marker so that a restarted coordinator can tell whether a task had begun
/// changing anything outside the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStep {
    /// The task holds the instance but has touched nothing else.
    Accepted,

    /// Capacity has been reserved for the task.
    Scheduled,

    /// A call that changes host-side state has been issued.
    Executing,

    /// A resize or cold migration has copied the instance and is waiting for
    /// the user to confirm or revert it.
    AwaitingConfirmation,

    Confirming,
    Reverting,
}

impl TaskStep {
    /// Returns true if the task may have changed state on a host or in an
    /// external service.
    pub fn has_external_effects(&self) -> bool {
        !matches!(self, TaskStep::Accepted | TaskStep::Scheduled)
    }
}

/// The per-instance advisory lock held by an in-progress task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskMarker {
    pub kind: ActionKind,
    pub step: TaskStep,
    pub request_id: RequestId,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,

    /// Reservations made on behalf of this task that are not yet owned by
    /// the instance record.
    pub reservations: Vec<ReservationUuid>,

    /// The state to return to if the task is abandoned before it changes
    /// anything outside the store.
    pub previous_state: InstanceState,
}

/// Bookkeeping for a resize or cold migration awaiting confirmation.
#[derive(Clone, Debug, Serialize)]
pub struct ResizeContext {
    pub kind: ActionKind,
    pub old_footprint: Footprint,
    pub new_footprint: Footprint,
    pub source_host: HostUuid,
    pub target_host: HostUuid,
    pub source_allocation: Option<ReservationUuid>,
    pub target_allocation: ReservationUuid,

    /// `ACTIVE` or `STOPPED`: where confirm or revert leaves the instance.
    pub return_state: InstanceState,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeAttachment {
    pub volume: VolumeUuid,
    pub device: String,
    pub driver_volume_type: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct InstanceRecord {
    pub id: InstanceUuid,
    pub name: String,
    pub state: InstanceState,
    pub host: Option<HostUuid>,
    pub footprint: Footprint,
    pub image: ImageUuid,
    pub availability_zone: Option<String>,
    pub cell: Option<CellName>,
    pub locked_by: Option<LockedBy>,
    pub task: Option<TaskMarker>,

    /// The committed allocation backing `footprint` on `host`.
    pub allocation: Option<ReservationUuid>,
    pub resize: Option<ResizeContext>,
    pub volumes: BTreeMap<VolumeUuid, VolumeAttachment>,
    pub fixed_ips: Vec<IpAddr>,
    pub floating_ips: BTreeSet<IpAddr>,

    /// Attached ports and the fixed address each one carries.
    pub ports: BTreeMap<PortUuid, IpAddr>,
    pub metadata: BTreeMap<String, String>,
    pub fault: Option<String>,

    /// Scheduling inputs kept so that moves are placed under the same
    /// constraints as the original build.
    pub extra_specs: BTreeMap<String, String>,
    pub image_properties: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,

    /// Bumped on every update.
    pub generation: u64,
}

impl InstanceRecord {
    pub fn new(
        id: InstanceUuid,
        name: String,
        footprint: Footprint,
        image: ImageUuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            state: InstanceState::Building,
            host: None,
            footprint,
            image,
            availability_zone: None,
            cell: None,
            locked_by: None,
            task: None,
            allocation: None,
            resize: None,
            volumes: BTreeMap::new(),
            fixed_ips: Vec::new(),
            floating_ips: BTreeSet::new(),
            ports: BTreeMap::new(),
            metadata: BTreeMap::new(),
            fault: None,
            extra_specs: BTreeMap::new(),
            image_properties: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            generation: 0,
        }
    }

    /// Drops a resize context that no task will confirm or revert any more.
    /// Returns the allocations it held that do not back the instance where
    /// the record now places it; the caller must release them.
    pub fn settle_resize(&mut self) -> Vec<ReservationUuid> {
        let Some(resize) = self.resize.take() else {
            return Vec::new();
        };
        let current = self.allocation;
        resize
            .source_allocation
            .into_iter()
            .chain(Some(resize.target_allocation))
            .filter(|a| Some(*a) != current)
            .collect()
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            task: self.task.as_ref().map(|t| t.kind),
            task_step: self.task.as_ref().map(|t| t.step),
            host: self.host,
            footprint: self.footprint,
            image: self.image,
            availability_zone: self.availability_zone.clone(),
            cell: self.cell.clone(),
            locked: self.locked_by.is_some(),
            volumes: self.volumes.values().cloned().collect(),
            fixed_ips: self.fixed_ips.clone(),
            floating_ips: self.floating_ips.iter().copied().collect(),
            ports: self.ports.keys().copied().collect(),
            metadata: self.metadata.clone(),
            fault: self.fault.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            generation: self.generation,
        }
    }
}

/// A caller-facing snapshot of an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceView {
    pub id: InstanceUuid,
    pub name: String,
    pub state: InstanceState,
    pub task: Option<ActionKind>,
    pub task_step: Option<TaskStep>,
    pub host: Option<HostUuid>,
    pub footprint: Footprint,
    pub image: ImageUuid,
    pub availability_zone: Option<String>,
    pub cell: Option<CellName>,
    pub locked: bool,
    pub volumes: Vec<VolumeAttachment>,
    pub fixed_ips: Vec<IpAddr>,
    pub floating_ips: Vec<IpAddr>,
    pub ports: Vec<PortUuid>,
    pub metadata: BTreeMap<String, String>,
    pub fault: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub generation: u64,
}
