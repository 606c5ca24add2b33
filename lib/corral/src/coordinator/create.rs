// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance creation.
//!
//! A batch is placed as a whole before any record exists: if fewer than
//! `min_count` instances fit, the scheduler releases every reservation it
//! made and the request fails without a trace in the store. Once placed,
//! each instance is built independently, and one that fails to build ends up
//! in `ERROR` without affecting the others.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use corral_types::{
    ActionKind, CellName, Footprint, HostUuid, ImageUuid, InstanceState,
    InstanceUuid,
};
use serde::Deserialize;
use slog::{info, o, warn};

use super::{Coordinator, Outcome, RequestContext, Rollback, Task};
use crate::error::OrchestrationError;
use crate::instance::state_machine::TaskUse;
use crate::instance::{
    InstanceRecord, InstanceView, Plan, TaskMarker, TaskStep,
};
use crate::scheduler::{RequestSpec, SchedulerHints, Selection};
use crate::services::ServiceError;

/// Placement hints that refer to other instances.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlacementHints {
    pub same_host: Vec<InstanceUuid>,
    pub different_host: Vec<InstanceUuid>,
    pub soft_affinity: Vec<InstanceUuid>,
    pub soft_anti_affinity: Vec<InstanceUuid>,

    /// Pins the build to a named host. Administrators only.
    pub force_host: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub footprint: Footprint,
    pub image: ImageUuid,

    #[serde(default)]
    pub availability_zone: Option<String>,

    #[serde(default)]
    pub cell: Option<CellName>,

    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub admin_password: Option<String>,

    #[serde(default = "one")]
    pub min_count: u32,

    #[serde(default = "one")]
    pub max_count: u32,

    #[serde(default)]
    pub hints: PlacementHints,
}

fn one() -> u32 {
    1
}

impl CreateRequest {
    pub fn new(
        name: impl Into<String>,
        footprint: Footprint,
        image: ImageUuid,
    ) -> Self {
        Self {
            name: name.into(),
            footprint,
            image,
            availability_zone: None,
            cell: None,
            extra_specs: BTreeMap::new(),
            metadata: BTreeMap::new(),
            network: None,
            admin_password: None,
            min_count: 1,
            max_count: 1,
            hints: PlacementHints::default(),
        }
    }

    fn validate(&self, max_batch_size: u32) -> Result<(), OrchestrationError> {
        if self.name.trim().is_empty() {
            return Err(OrchestrationError::validation(
                "instance name must not be empty",
            ));
        }
        if self.footprint.vcpus == 0 || self.footprint.memory_mib == 0 {
            return Err(OrchestrationError::validation(format!(
                "footprint {} needs at least one vCPU and some memory",
                self.footprint
            )));
        }
        if self.min_count == 0 || self.min_count > self.max_count {
            return Err(OrchestrationError::validation(format!(
                "min_count {} must be between 1 and max_count {}",
                self.min_count, self.max_count
            )));
        }
        if self.max_count > max_batch_size {
            return Err(OrchestrationError::validation(format!(
                "max_count {} exceeds the batch limit of {}",
                self.max_count, max_batch_size
            )));
        }
        Ok(())
    }
}

impl Coordinator {
    /// Creates between `min_count` and `max_count` instances.
    ///
    /// Instances that were placed but failed to build are returned in
    /// `ERROR` alongside the ones that succeeded.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        request: CreateRequest,
    ) -> Result<Vec<InstanceView>, OrchestrationError> {
        request.validate(self.timers.max_batch_size)?;
        if request.hints.force_host.is_some() && !ctx.is_admin {
            return Err(OrchestrationError::validation(
                "forcing a host requires an administrator",
            ));
        }
        self.run(ctx, ActionKind::Create, None, self.create_batch(ctx, request))
            .await?
            .into_instances()
    }

    fn resolve_hints(
        &self,
        hints: &PlacementHints,
    ) -> Result<SchedulerHints, OrchestrationError> {
        type Hosts = Result<BTreeSet<HostUuid>, OrchestrationError>;
        let hosts_of = |ids: &[InstanceUuid]| -> Hosts {
            let mut hosts = BTreeSet::new();
            for id in ids {
                let record = self.store.get(*id).map_err(|_| {
                    OrchestrationError::validation(format!(
                        "hint refers to unknown instance {id}"
                    ))
                })?;
                hosts.extend(record.host);
            }
            Ok(hosts)
        };

        let mut resolved = SchedulerHints {
            same_host: hosts_of(&hints.same_host)?,
            different_host: hosts_of(&hints.different_host)?,
            soft_affinity: hosts_of(&hints.soft_affinity)?,
            soft_anti_affinity: hosts_of(&hints.soft_anti_affinity)?,
            ..Default::default()
        };
        if let Some(name) = &hints.force_host {
            let host = self.inventory.host_by_name(name).ok_or_else(|| {
                OrchestrationError::validation(format!("unknown host {name}"))
            })?;
            resolved.force_hosts.insert(host);
        }
        Ok(resolved)
    }

    async fn create_batch(
        &self,
        ctx: &RequestContext,
        request: CreateRequest,
    ) -> Result<Outcome, OrchestrationError> {
        let images = &self.services.images;
        let image = self
            .retry
            .idempotent(&self.log, "get_image", || {
                images.get_image(request.image)
            })
            .await
            .map_err(|e| match e {
                ServiceError::NotFound(_) => OrchestrationError::validation(
                    format!("image {} does not exist", request.image),
                ),
                e => e.into(),
            })?;
        if request.footprint.memory_mib < image.min_memory_mib
            || request.footprint.disk_gib < image.min_disk_gib
        {
            return Err(OrchestrationError::validation(format!(
                "footprint {} is smaller than image {} requires",
                request.footprint, image.name
            )));
        }
        if let Some(zone) = &request.availability_zone {
            if !self.directory.availability_zones().contains(zone) {
                return Err(OrchestrationError::validation(format!(
                    "unknown availability zone {zone}"
                )));
            }
        }
        if let Some(cell) = &request.cell {
            if !self.directory.cells().iter().any(|(name, _)| name == cell) {
                return Err(OrchestrationError::validation(format!(
                    "unknown cell {cell}"
                )));
            }
        }
        let hints = self.resolve_hints(&request.hints)?;

        let specs: Vec<RequestSpec> = (0..request.max_count)
            .map(|_| RequestSpec {
                instance: InstanceUuid::new_v4(),
                footprint: request.footprint,
                availability_zone: request.availability_zone.clone(),
                cell: request.cell.clone(),
                extra_specs: request.extra_specs.clone(),
                image_properties: image.properties.clone(),
            })
            .collect();
        let selections = self.scheduler.select_batch(
            &specs,
            &hints,
            request.min_count as usize,
        )?;
        info!(self.log, "batch placed";
              "request_id" => %ctx.request_id,
              "placed" => selections.len(),
              "requested" => request.max_count);

        let tasks = self.admit_all(ctx, &request, &specs, &selections)?;
        let builds = tasks
            .iter()
            .zip(&selections)
            .map(|(task, selection)| self.build(task, *selection, &request));
        let views = futures::future::join_all(builds).await;
        Ok(Outcome::Instances(views))
    }

    /// Stores a record for every placed instance of a batch, or for none of
    /// them. On failure every selection is released and the records already
    /// stored are withdrawn along with their actions.
    fn admit_all(
        &self,
        ctx: &RequestContext,
        request: &CreateRequest,
        specs: &[RequestSpec],
        selections: &[Selection],
    ) -> Result<Vec<Task>, OrchestrationError> {
        let batch = selections.len() > 1;
        let mut tasks = Vec::with_capacity(selections.len());
        let placed = specs.iter().zip(selections);
        for (index, (spec, selection)) in placed.enumerate() {
            let name = if batch {
                format!("{}-{}", request.name, index + 1)
            } else {
                request.name.clone()
            };
            let err = match self.admit(ctx, name, spec, *selection, request) {
                Ok(task) => {
                    tasks.push(task);
                    continue;
                }
                Err(e) => e,
            };

            // `admit` has already released the selection it failed on.
            for later in &selections[index + 1..] {
                self.inventory.release(later.reservation);
            }
            let withdrawn: Vec<_> = tasks.iter().map(|t| t.id).collect();
            for (id, earlier) in withdrawn.iter().zip(selections) {
                self.store.remove(*id);
                self.inventory.release(earlier.reservation);
            }
            self.actions.forget_instances(&withdrawn);
            warn!(self.log, "batch admission failed";
                  "request_id" => %ctx.request_id,
                  "admitted" => withdrawn.len(),
                  "error" => %err);
            return Err(err);
        }
        Ok(tasks)
    }

    /// Stores the record for one placed instance, holding its task marker.
    fn admit(
        &self,
        ctx: &RequestContext,
        name: String,
        spec: &RequestSpec,
        selection: Selection,
        request: &CreateRequest,
    ) -> Result<Task, OrchestrationError> {
        let mut record = InstanceRecord::new(
            spec.instance,
            name,
            request.footprint,
            request.image,
        );
        record.availability_zone = Some(
            request.availability_zone.clone().unwrap_or_else(|| {
                self.directory.availability_zone_for_host(selection.host)
            }),
        );
        record.cell = self.directory.cell_of(selection.host);
        record.metadata = request.metadata.clone();
        record.extra_specs = spec.extra_specs.clone();
        record.image_properties = spec.image_properties.clone();
        record.task = Some(TaskMarker {
            kind: ActionKind::Create,
            step: TaskStep::Scheduled,
            request_id: ctx.request_id.clone(),
            started_at: Utc::now(),
            cancel_requested: false,
            reservations: vec![selection.reservation],
            previous_state: InstanceState::Building,
        });
        if let Err(e) = self.store.insert(record.clone()) {
            self.inventory.release(selection.reservation);
            return Err(e.into());
        }

        let action_id = self.actions.start_action(
            record.id,
            &ctx.request_id,
            ActionKind::Create,
        );
        self.note(self.actions.start_event(action_id, "schedule"));
        self.note(self.actions.finish_event(action_id, "schedule", Ok(())));

        let log = self.log.new(o!(
            "instance" => record.id.to_string(),
            "request_id" => ctx.request_id.to_string(),
            "action" => ActionKind::Create.to_string(),
        ));
        info!(log, "building instance"; "host" => %selection.host);
        Ok(Task {
            id: record.id,
            action_id,
            plan: Plan {
                action: ActionKind::Create,
                task: TaskUse::Acquire,
                during: InstanceState::Building,
                on_success: InstanceState::Active,
            },
            owner: Some(ctx.request_id.clone()),
            record,
            log,
        })
    }

    /// Builds one admitted instance. Failures are recorded on the instance
    /// rather than returned.
    async fn build(
        &self,
        task: &Task,
        selection: Selection,
        request: &CreateRequest,
    ) -> InstanceView {
        match self.try_build(task, selection, request).await {
            Ok(view) => view,
            Err(e) => {
                self.clean_up_build(task, selection.host).await;
                let rollback = match e {
                    OrchestrationError::Cancelled(_) => Rollback::Restore,
                    _ => Rollback::Error,
                };
                self.fail(task, e, rollback);
                // A cancelled build has nothing to return to.
                let _ = self.store.update(task.id, |r| {
                    if r.state == InstanceState::Building {
                        r.state = InstanceState::Error;
                        r.fault = Some("build cancelled".to_string());
                    }
                    r.host = None;
                    r.fixed_ips.clear();
                });
                match self.store.get(task.id) {
                    Ok(record) => record.view(),
                    Err(_) => task.record.view(),
                }
            }
        }
    }

    async fn try_build(
        &self,
        task: &Task,
        selection: Selection,
        request: &CreateRequest,
    ) -> Result<InstanceView, OrchestrationError> {
        let id = task.id;
        let host = selection.host;
        if self.cancel_requested(task) {
            return Err(OrchestrationError::Cancelled(
                "build cancelled before it started".to_string(),
            ));
        }

        let network = &self.services.network;
        let fixed_ip = self
            .event(
                task,
                "allocate_network",
                self.retry.idempotent(&task.log, "allocate_fixed_ip", || {
                    network.allocate_fixed_ip(id, request.network.clone())
                }),
            )
            .await?;
        self.store.update(id, |r| {
            r.fixed_ips.push(fixed_ip);
            r.host = Some(host);
            if let Some(marker) = r.task.as_mut() {
                marker.step = TaskStep::Executing;
            }
        })?;

        self.inventory.renew(selection.reservation)?;
        let agent = &self.services.agent;
        let footprint = request.footprint;
        let spawn = self.retry.non_idempotent(
            &task.log,
            "spawn",
            || {
                agent.spawn(
                    host,
                    id,
                    footprint,
                    request.image,
                    request.admin_password.clone(),
                )
            },
            || self.landed(host, id, None),
        );
        self.event(task, "spawn", spawn).await?;

        self.inventory.commit(selection.reservation)?;
        self.complete(task, |r| r.allocation = Some(selection.reservation))
    }

    /// Undoes whatever a failed build left on the host and the network.
    async fn clean_up_build(&self, task: &Task, host: HostUuid) {
        let id = task.id;
        let Ok(record) = self.store.get(id) else {
            return;
        };
        if record.host.is_some() {
            let agent = &self.services.agent;
            self.best_effort(
                task,
                "destroy",
                self.retry.once(agent.destroy(host, id)),
            )
            .await;
        }
        let network = &self.services.network;
        for address in record.fixed_ips {
            self.best_effort(
                task,
                "deallocate_network",
                self.retry.once(network.deallocate_fixed_ip(id, address)),
            )
            .await;
        }
        warn!(task.log, "build failed"; "host" => %host);
    }
}
