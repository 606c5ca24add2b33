// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The orchestration coordinator.
//!
//! Every lifecycle verb follows the same shape:
//!
//! 1. Inputs are validated before anything is looked up.
//! 2. The request ID is registered with the [`ActionLog`]. A request that
//!    already finished is answered with its recorded outcome, and one that
//!    is still running is refused.
//! 3. The instance's task marker is taken with a single conditional update
//!    of the record, after [`plan`] has decided the request is legal.
//! 4. The task's steps run in order. Each external call is recorded as an
//!    event on the action, and the step reached is written back into the
//!    task marker so that [`Coordinator::recover_interrupted_tasks`] can
//!    tell what was in flight after a restart.
//! 5. The final step releases the task marker, and the outcome is recorded
//!    against the request ID.
//!
//! Failures either restore the state the instance had before the task (when
//! nothing outside the store was changed, or the change was undone) or move
//! the instance to `ERROR`. Either way every reservation held by the task is
//! released.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use corral_config::Config;
use corral_types::{
    ActionKind, ActionUuid, Footprint, HostUuid, InstanceState, InstanceUuid,
    RequestId, ReservationUuid,
};
use serde::Serialize;
use slog::{info, o, warn, Logger};
use thiserror::Error;

use crate::action_log::{
    ActionLog, ActionLogError, ActionRecord, RequestStatus,
};
use crate::directory::{Directory, DirectoryError};
use crate::error::OrchestrationError;
use crate::instance::state_machine::TaskUse;
use crate::instance::{
    plan, InstanceFilter, InstanceRecord, InstanceStore, InstanceView, Plan,
    PlanContext, TaskMarker, TaskStep,
};
use crate::inventory::{HostSpec, InventoryError, ResourceInventory};
use crate::network::{FloatingIpTable, NetworkError};
use crate::retry::{RemoteOutcome, RetryPolicy};
use crate::scheduler::filters::FilterRegistry;
use crate::scheduler::{
    RequestSpec, Scheduler, SchedulerError, SchedulerHints, Selection,
};
use crate::services::{ServiceError, Services};
use crate::volume_drivers::{VolumeDriverError, VolumeDriverRegistry};

mod admin;
mod attachments;
mod backup;
mod create;
mod delete;
mod evacuate;
mod maintenance;
mod power;
mod recovery;
mod resize;

pub use backup::Backup;
pub use create::{CreateRequest, PlacementHints};
pub use evacuate::Evacuation;
pub use maintenance::{spawn_maintenance, MaintenanceReport};
pub use recovery::RecoveryReport;
pub use resize::DrainReport;

/// Who is asking, and under which request ID.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub is_admin: bool,
}

impl RequestContext {
    pub fn new(request_id: RequestId) -> Self {
        Self { request_id, is_admin: false }
    }

    pub fn admin(request_id: RequestId) -> Self {
        Self { request_id, is_admin: true }
    }

    /// An administrative context with a fresh request ID, used for work the
    /// coordinator starts on its own.
    pub fn internal() -> Self {
        Self::admin(RequestId::generate())
    }
}

/// The recorded result of a finished request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Instance(InstanceView),
    Instances(Vec<InstanceView>),
    Evacuated(Evacuation),
    BackedUp(Backup),
}

impl Outcome {
    fn mismatch(&self, wanted: &str) -> OrchestrationError {
        OrchestrationError::Fatal(format!(
            "recorded outcome is not {wanted}: {self:?}"
        ))
    }

    pub fn into_instance(self) -> Result<InstanceView, OrchestrationError> {
        match self {
            Outcome::Instance(view) => Ok(view),
            other => Err(other.mismatch("an instance")),
        }
    }

    pub fn into_instances(
        self,
    ) -> Result<Vec<InstanceView>, OrchestrationError> {
        match self {
            Outcome::Instances(views) => Ok(views),
            other => Err(other.mismatch("a list of instances")),
        }
    }
}

/// Errors raised while assembling a coordinator from configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    VolumeDriver(#[from] VolumeDriverError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Lifecycle timers, copied out of the configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Timers {
    pub reclaim_interval: Option<std::time::Duration>,
    pub resize_confirm_window: Option<std::time::Duration>,
    pub deleted_retention: std::time::Duration,
    pub maintenance_interval: std::time::Duration,
    pub max_batch_size: u32,
}

/// What a failed task leaves behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rollback {
    /// Return to the state the instance had when the task started.
    Restore,

    /// Move the instance to `ERROR`.
    Error,
}

/// A task that holds (or, for marker-free verbs, was admitted against) an
/// instance.
struct Task {
    id: InstanceUuid,
    action_id: ActionUuid,
    plan: Plan,

    /// The record as it was right after the marker was taken.
    record: InstanceRecord,

    /// The request that owns the marker. For confirm and revert this is the
    /// original resize request.
    owner: Option<RequestId>,
    log: Logger,
}

impl Task {
    fn host(&self) -> Result<HostUuid, OrchestrationError> {
        self.record.host.ok_or_else(|| {
            OrchestrationError::Conflict(format!(
                "instance {} is not on a host",
                self.id
            ))
        })
    }
}

pub struct Coordinator {
    store: InstanceStore,
    inventory: Arc<ResourceInventory>,
    directory: Arc<Directory>,
    scheduler: Scheduler,
    actions: ActionLog,
    floating_ips: FloatingIpTable,
    services: Services,
    volume_drivers: VolumeDriverRegistry,
    retry: RetryPolicy,
    timers: Timers,
    allow_resize_to_same_host: bool,
    log: Logger,
}

impl Coordinator {
    /// Builds a coordinator and seeds it with the topology in `config`.
    pub fn new(
        config: &Config,
        services: Services,
        log: Logger,
    ) -> Result<Self, SetupError> {
        let inventory = Arc::new(ResourceInventory::new(
            &config.inventory,
            log.new(o!("component" => "inventory")),
        ));
        let directory = Arc::new(Directory::new(
            config.scheduler.default_availability_zone.clone(),
            log.new(o!("component" => "directory")),
        ));
        let scheduler = Scheduler::new(
            &config.scheduler,
            &FilterRegistry::builtin(),
            inventory.clone(),
            directory.clone(),
            log.new(o!("component" => "scheduler")),
        )?;
        let volume_drivers = VolumeDriverRegistry::new(&config.volume.drivers)?;
        let lifecycle = &config.lifecycle;

        let coordinator = Self {
            store: InstanceStore::new(),
            inventory,
            directory,
            scheduler,
            actions: ActionLog::new(),
            floating_ips: FloatingIpTable::new(
                log.new(o!("component" => "floating_ips")),
            ),
            services,
            volume_drivers,
            retry: RetryPolicy::new(&config.retry),
            timers: Timers {
                reclaim_interval: lifecycle.reclaim_instance_interval(),
                resize_confirm_window: lifecycle.resize_confirm_window(),
                deleted_retention: lifecycle.deleted_retention(),
                maintenance_interval: lifecycle.maintenance_interval(),
                max_batch_size: lifecycle.max_batch_size,
            },
            allow_resize_to_same_host: config
                .scheduler
                .allow_resize_to_same_host,
            log: log.new(o!("component" => "coordinator")),
        };
        coordinator.load_topology(config)?;
        Ok(coordinator)
    }

    fn load_topology(&self, config: &Config) -> Result<(), SetupError> {
        // Parents must exist before their children, whatever order the
        // file lists them in.
        let mut pending: Vec<_> = config.cells.iter().collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for cell in pending {
                let ready = cell.parent.as_ref().map_or(true, |p| {
                    self.directory.cells().iter().any(|(name, _)| name == p)
                });
                if ready {
                    self.directory
                        .create_cell(cell.name.clone(), cell.parent.clone())?;
                } else {
                    deferred.push(cell);
                }
            }
            if deferred.len() == before {
                let cell = deferred[0];
                return Err(DirectoryError::CellNotFound(
                    cell.parent.clone().unwrap_or_else(|| cell.name.clone()),
                )
                .into());
            }
            pending = deferred;
        }

        for host in &config.hosts {
            self.register_host(HostSpec {
                name: host.name.clone(),
                cell: host.cell.clone(),
                capacity: host.capacity(),
                capabilities: host.capabilities.clone(),
            })?;
        }

        for aggregate in &config.aggregates {
            let id = self.directory.create_aggregate(
                &aggregate.name,
                aggregate.availability_zone.clone(),
            )?;
            for (key, value) in &aggregate.metadata {
                self.directory.set_metadata(id, key, Some(value.clone()))?;
            }
            for name in &aggregate.hosts {
                let host = self.inventory.host_by_name(name).ok_or_else(|| {
                    DirectoryError::InvalidName(name.clone())
                })?;
                self.directory.add_host(id, host)?;
            }
        }

        for pool in &config.floating_ip_pools {
            self.floating_ips
                .add_pool(&pool.name, pool.addresses.iter().copied())?;
        }

        info!(self.log, "topology loaded";
              "cells" => config.cells.len(),
              "hosts" => config.hosts.len(),
              "aggregates" => config.aggregates.len());
        Ok(())
    }

    pub fn inventory(&self) -> &Arc<ResourceInventory> {
        &self.inventory
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn floating_ips(&self) -> &FloatingIpTable {
        &self.floating_ips
    }

    pub fn maintenance_interval(&self) -> std::time::Duration {
        self.timers.maintenance_interval
    }

    /// Adds a host to the inventory and places it in its cell.
    pub fn register_host(
        &self,
        spec: HostSpec,
    ) -> Result<HostUuid, SetupError> {
        let cell = spec.cell.clone();
        let id = self.inventory.register_host(spec)?;
        if let Err(e) = self.directory.assign_host(id, cell) {
            // Leave no half-registered host behind.
            let _ = self.inventory.remove_host(id);
            return Err(e.into());
        }
        Ok(id)
    }

    /// Removes a host that holds no allocations and no instances.
    pub fn remove_host(&self, id: HostUuid) -> Result<(), OrchestrationError> {
        let resident = self.store.list(&InstanceFilter {
            host: Some(id),
            ..Default::default()
        });
        if !resident.is_empty() {
            return Err(OrchestrationError::Conflict(format!(
                "host {id} still has {} instances",
                resident.len()
            )));
        }
        self.inventory.remove_host(id)?;
        self.directory.forget_host(id);
        Ok(())
    }

    // Queries

    pub fn get(
        &self,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        Ok(self.store.get(id)?.view())
    }

    pub fn list(&self, filter: &InstanceFilter) -> Vec<InstanceView> {
        self.store.list(filter).iter().map(InstanceRecord::view).collect()
    }

    pub async fn console_output(
        &self,
        id: InstanceUuid,
        length: Option<usize>,
    ) -> Result<String, OrchestrationError> {
        let record = self.store.get(id)?;
        let running = matches!(
            record.state,
            InstanceState::Active
                | InstanceState::Rescued
                | InstanceState::Paused
        );
        let host = match record.host {
            Some(host) if running => host,
            _ => {
                return Err(OrchestrationError::Conflict(format!(
                    "instance {id} is not running (state {})",
                    record.state
                )))
            }
        };
        let agent = &self.services.agent;
        Ok(self
            .retry
            .idempotent(&self.log, "get_console_output", || {
                agent.get_console_output(host, id, length)
            })
            .await?)
    }

    pub async fn uptime(
        &self,
        host: HostUuid,
    ) -> Result<String, OrchestrationError> {
        self.inventory.host(host)?;
        let agent = &self.services.agent;
        Ok(self
            .retry
            .idempotent(&self.log, "get_uptime", || agent.get_uptime(host))
            .await?)
    }

    pub fn actions(
        &self,
        id: InstanceUuid,
    ) -> Result<Vec<ActionRecord>, OrchestrationError> {
        self.store.get(id)?;
        Ok(self.actions.actions(id))
    }

    pub fn action(
        &self,
        id: InstanceUuid,
        request_id: &RequestId,
    ) -> Result<ActionRecord, OrchestrationError> {
        self.store.get(id)?;
        self.actions.action(id, request_id).ok_or_else(|| {
            OrchestrationError::not_found(format!(
                "action for request {request_id} on instance {id}"
            ))
        })
    }

    // Plumbing shared by the verbs

    fn plan_context(&self, ctx: &RequestContext) -> PlanContext {
        PlanContext {
            is_admin: ctx.is_admin,
            soft_delete: self.timers.reclaim_interval.is_some(),
            ..Default::default()
        }
    }

    /// Runs `op` once per request ID, replaying the recorded outcome for a
    /// request that already finished.
    async fn run<Fut>(
        &self,
        ctx: &RequestContext,
        action: ActionKind,
        instance: Option<InstanceUuid>,
        op: Fut,
    ) -> Result<Outcome, OrchestrationError>
    where
        Fut: Future<Output = Result<Outcome, OrchestrationError>>,
    {
        match self.actions.begin_request(&ctx.request_id, action, instance)? {
            RequestStatus::Fresh => {}
            RequestStatus::Replay(outcome) => {
                info!(self.log, "replaying finished request";
                      "request_id" => %ctx.request_id,
                      "action" => %action);
                return outcome;
            }
            RequestStatus::InFlight => {
                return Err(OrchestrationError::Conflict(format!(
                    "request {} is already in progress",
                    ctx.request_id
                )));
            }
        }
        let outcome = op.await;
        self.actions.finish_request(&ctx.request_id, outcome.clone());
        outcome
    }

    /// Records a request refused before it touched the instance.
    fn reject(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        action: ActionKind,
        err: OrchestrationError,
    ) -> OrchestrationError {
        if !matches!(err, OrchestrationError::NotFound(_)) {
            self.actions.record_rejection(
                id,
                &ctx.request_id,
                action,
                &err.to_string(),
            );
        }
        info!(self.log, "request rejected";
              "instance" => %id,
              "request_id" => %ctx.request_id,
              "action" => %action,
              "error" => %err);
        err
    }

    /// Checks legality and takes the task marker in one update.
    fn begin(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        action: ActionKind,
        pctx: PlanContext,
    ) -> Result<Task, OrchestrationError> {
        let request_id = ctx.request_id.clone();
        let admitted = self.store.try_update(id, |r| {
            let plan = plan(r, action, &pctx)?;
            match plan.task {
                TaskUse::Acquire => {
                    r.task = Some(TaskMarker {
                        kind: action,
                        step: TaskStep::Accepted,
                        request_id,
                        started_at: Utc::now(),
                        cancel_requested: false,
                        reservations: Vec::new(),
                        previous_state: r.state,
                    });
                }
                TaskUse::Continue => {
                    if let Some(task) = r.task.as_mut() {
                        task.step = if action == ActionKind::ConfirmResize {
                            TaskStep::Confirming
                        } else {
                            TaskStep::Reverting
                        };
                    }
                }
                TaskUse::None => {}
            }
            r.state = plan.during;
            Ok::<_, OrchestrationError>(plan)
        });

        let (plan, record) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => return Err(self.reject(ctx, id, action, e)),
        };
        let action_id =
            self.actions.start_action(id, &ctx.request_id, action);
        let log = self.log.new(o!(
            "instance" => id.to_string(),
            "request_id" => ctx.request_id.to_string(),
            "action" => action.to_string(),
        ));
        info!(log, "task started"; "state" => %record.state);
        Ok(Task {
            id,
            action_id,
            plan,
            owner: record.task.as_ref().map(|t| t.request_id.clone()),
            record,
            log,
        })
    }

    fn note(&self, result: Result<(), ActionLogError>) {
        if let Err(e) = result {
            warn!(self.log, "could not update action log"; "error" => %e);
        }
    }

    /// Runs `fut` as a named event of the task's action.
    async fn event<T, E, Fut>(
        &self,
        task: &Task,
        name: &'static str,
        fut: Fut,
    ) -> Result<T, E>
    where
        E: fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.note(self.actions.start_event(task.action_id, name));
        let result = fut.await;
        let summary = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        self.note(self.actions.finish_event(task.action_id, name, summary));
        result
    }

    /// Runs a cleanup call whose failure should not fail the task.
    async fn best_effort<Fut>(&self, task: &Task, name: &'static str, fut: Fut)
    where
        Fut: Future<Output = Result<(), ServiceError>>,
    {
        if let Err(e) = self.event(task, name, fut).await {
            warn!(task.log, "cleanup step failed";
                  "step" => name,
                  "error" => %e);
        }
    }

    /// Persists the step a task has reached, along with any reservation it
    /// now holds.
    fn set_step(
        &self,
        task: &Task,
        step: TaskStep,
        reservation: Option<ReservationUuid>,
    ) -> Result<(), OrchestrationError> {
        self.store.update(task.id, |r| {
            if let Some(marker) = r.task.as_mut() {
                marker.step = step;
                marker.reservations.extend(reservation);
            }
        })?;
        Ok(())
    }

    fn cancel_requested(&self, task: &Task) -> bool {
        self.store
            .get(task.id)
            .ok()
            .and_then(|r| r.task)
            .is_some_and(|t| t.cancel_requested)
    }

    fn still_owned(&self, task: &Task, record: &InstanceRecord) -> bool {
        task.plan.task == TaskUse::None
            || record.task.as_ref().map(|t| &t.request_id)
                == task.owner.as_ref()
    }

    /// Finishes a task successfully: the instance enters the plan's resting
    /// state, `f` applies the task's results, and the marker is released.
    fn complete(
        &self,
        task: &Task,
        f: impl FnOnce(&mut InstanceRecord),
    ) -> Result<InstanceView, OrchestrationError> {
        let (_, record) = self.store.try_update(task.id, |r| {
            if !self.still_owned(task, r) {
                return Err(OrchestrationError::Conflict(format!(
                    "task on instance {} was reset while running",
                    task.id
                )));
            }
            if task.plan.task != TaskUse::None {
                r.state = task.plan.on_success;
                r.task = None;
            }
            f(r);
            Ok(())
        })?;
        self.note(self.actions.finish_action(task.action_id, Ok(())));
        info!(task.log, "task finished"; "state" => %record.state);
        Ok(record.view())
    }

    /// Finishes a task that failed, releasing every reservation its marker
    /// holds. A resize context left without a marker is settled too, so the
    /// copy the record no longer points at stops holding capacity.
    fn fail(
        &self,
        task: &Task,
        err: OrchestrationError,
        rollback: Rollback,
    ) -> OrchestrationError {
        let fault = err.to_string();
        let updated = self.store.try_update(task.id, |r| {
            if !self.still_owned(task, r) {
                return Ok(None);
            }
            let marker = r.task.take();
            r.state = match rollback {
                Rollback::Restore => marker
                    .as_ref()
                    .map_or(r.state, |m| m.previous_state),
                Rollback::Error => {
                    r.fault = Some(fault.clone());
                    InstanceState::Error
                }
            };
            let mut held = r.settle_resize();
            held.extend(marker.into_iter().flat_map(|m| m.reservations));
            Ok::<_, OrchestrationError>(Some(held))
        });
        match updated {
            Ok((Some(held), record)) => {
                for reservation in held {
                    self.inventory.release(reservation);
                }
                warn!(task.log, "task failed";
                      "state" => %record.state,
                      "error" => %err);
            }
            Ok((None, _)) => {
                warn!(task.log, "task failed after its marker was reset";
                      "error" => %err);
            }
            Err(e) => {
                warn!(task.log, "could not record task failure";
                      "error" => %err,
                      "store_error" => %e);
            }
        }
        self.note(self.actions.finish_action(task.action_id, Err(fault)));
        err
    }

    /// Abandons a task that was cancelled before it changed anything
    /// outside the store.
    fn abort(&self, task: &Task) -> OrchestrationError {
        self.fail(
            task,
            OrchestrationError::Cancelled(format!(
                "{} cancelled before it started",
                task.plan.action
            )),
            Rollback::Restore,
        )
    }

    /// Builds a placement request that keeps the instance's original
    /// scheduling constraints.
    fn spec_for(
        &self,
        record: &InstanceRecord,
        footprint: Footprint,
    ) -> RequestSpec {
        RequestSpec {
            instance: record.id,
            footprint,
            availability_zone: record.availability_zone.clone(),
            cell: None,
            extra_specs: record.extra_specs.clone(),
            image_properties: record.image_properties.clone(),
        }
    }

    /// Places the instance for a move and records the reservation on the
    /// task marker. A failure restores the instance's previous state.
    async fn schedule_move(
        &self,
        task: &Task,
        footprint: Footprint,
        hints: &SchedulerHints,
    ) -> Result<Selection, OrchestrationError> {
        let spec = self.spec_for(&task.record, footprint);
        let scheduled = self
            .event(task, "schedule", async {
                self.scheduler.select_host(&spec, hints)
            })
            .await;
        let selection = match scheduled {
            Ok(selection) => selection,
            Err(e) => return Err(self.fail(task, e.into(), Rollback::Restore)),
        };
        let reservation = Some(selection.reservation);
        if let Err(e) = self.set_step(task, TaskStep::Scheduled, reservation) {
            self.inventory.release(selection.reservation);
            return Err(self.fail(task, e, Rollback::Restore));
        }
        info!(task.log, "placed"; "host" => %selection.host);
        Ok(selection)
    }

    /// Asks `host` whether it holds a copy of the instance (with the given
    /// footprint, if one is named). Used to settle the outcome of calls that
    /// must not be blindly repeated.
    async fn landed(
        &self,
        host: HostUuid,
        id: InstanceUuid,
        footprint: Option<Footprint>,
    ) -> Result<RemoteOutcome, ServiceError> {
        let remote = self.services.agent.instance_state(host, id).await?;
        Ok(match remote {
            Some(r) if footprint.map_or(true, |f| f == r.footprint) => {
                RemoteOutcome::Completed
            }
            _ => RemoteOutcome::NotApplied,
        })
    }

    /// Checks an explicitly requested destination host.
    fn validate_target(
        &self,
        source: HostUuid,
        target: HostUuid,
    ) -> Result<(), OrchestrationError> {
        if source == target {
            return Err(OrchestrationError::validation(
                "target host is the instance's current host",
            ));
        }
        let info = self.inventory.host(target)?;
        if !info.accepts_new_work() {
            return Err(OrchestrationError::Precondition(format!(
                "target host {} is not up and enabled",
                info.name
            )));
        }
        Ok(())
    }
}
