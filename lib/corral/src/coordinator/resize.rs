// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resizes, cold and live migrations, and host draining.
//!
//! A resize (or cold migration) copies the instance to a newly reserved host
//! and parks it in `VERIFY_RESIZE` with the task marker still held at
//! [`TaskStep::AwaitingConfirmation`]. Both allocations stay in place until
//! the user confirms, which frees the source, or reverts, which frees the
//! target. A failure before that point frees the target reservation through
//! the task marker and leaves the source allocation untouched.

use chrono::Utc;
use corral_types::{
    ActionKind, Footprint, HostUuid, InstanceState, InstanceUuid,
};
use serde::Serialize;
use slog::{info, warn};

use super::{Coordinator, Outcome, RequestContext, Rollback, Task};
use crate::error::OrchestrationError;
use crate::instance::{InstanceFilter, InstanceView, ResizeContext, TaskStep};
use crate::scheduler::SchedulerHints;

/// What [`Coordinator::drain_host`] did with each resident instance.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DrainReport {
    pub migrated: Vec<InstanceUuid>,
    pub failed: Vec<(InstanceUuid, OrchestrationError)>,

    /// Instances that were not running or were busy with another task.
    pub skipped: Vec<InstanceUuid>,
}

impl Coordinator {
    /// Moves the instance to a new footprint. The result must be confirmed
    /// or reverted.
    pub async fn resize(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        footprint: Footprint,
    ) -> Result<InstanceView, OrchestrationError> {
        if footprint.vcpus == 0 || footprint.memory_mib == 0 {
            return Err(OrchestrationError::validation(format!(
                "footprint {footprint} needs at least one vCPU and some memory"
            )));
        }
        let kind = ActionKind::Resize;
        let op = self.cold_migrate(ctx, id, kind, Some(footprint), None);
        self.run(ctx, ActionKind::Resize, Some(id), op)
            .await?
            .into_instance()
    }

    /// Moves the instance to another host, keeping its footprint. Naming the
    /// target host is reserved for administrators.
    pub async fn migrate(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        target: Option<HostUuid>,
    ) -> Result<InstanceView, OrchestrationError> {
        if target.is_some() && !ctx.is_admin {
            return Err(OrchestrationError::validation(
                "choosing a target host requires an administrator",
            ));
        }
        let op = self.cold_migrate(ctx, id, ActionKind::Migrate, None, target);
        self.run(ctx, ActionKind::Migrate, Some(id), op)
            .await?
            .into_instance()
    }

    /// Builds the hints for moving an instance off `source`.
    fn move_hints(
        &self,
        task: &Task,
        source: HostUuid,
        target: Option<HostUuid>,
        same_host_allowed: bool,
    ) -> Result<SchedulerHints, OrchestrationError> {
        let mut hints = SchedulerHints::default();
        if !same_host_allowed {
            hints.ignore_hosts.insert(source);
        }
        if let Some(target) = target {
            if let Err(e) = self.validate_target(source, target) {
                return Err(self.fail(task, e, Rollback::Restore));
            }
            hints.force_hosts.insert(target);
        }
        Ok(hints)
    }

    async fn cold_migrate(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        action: ActionKind,
        footprint: Option<Footprint>,
        target: Option<HostUuid>,
    ) -> Result<Outcome, OrchestrationError> {
        let task = self.begin(ctx, id, action, self.plan_context(ctx))?;
        let source = match task.host() {
            Ok(host) => host,
            Err(e) => return Err(self.fail(&task, e, Rollback::Restore)),
        };
        let old = task.record.footprint;
        let new = footprint.unwrap_or(old);
        if footprint == Some(old) {
            let err = OrchestrationError::validation(format!(
                "instance {id} already has footprint {new}"
            ));
            return Err(self.fail(&task, err, Rollback::Restore));
        }
        let same_host_allowed =
            action == ActionKind::Resize && self.allow_resize_to_same_host;
        let hints = self.move_hints(&task, source, target, same_host_allowed)?;
        let selection = self.schedule_move(&task, new, &hints).await?;
        let target = selection.host;

        if self.cancel_requested(&task) {
            return Err(self.abort(&task));
        }
        self.set_step(&task, TaskStep::Executing, None)
            .map_err(|e| self.fail(&task, e, Rollback::Restore))?;
        if let Err(e) = self.inventory.renew(selection.reservation) {
            return Err(self.fail(&task, e.into(), Rollback::Restore));
        }

        let agent = &self.services.agent;
        let migrated = self.retry.non_idempotent(
            &task.log,
            "migrate",
            || agent.migrate(source, target, id, new),
            || self.landed(target, id, Some(new)),
        );
        let landed = match self.event(&task, "migrate", migrated).await {
            Ok(_) => self
                .inventory
                .commit(selection.reservation)
                .map_err(OrchestrationError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = landed {
            return Err(self.undo_migration(&task, source, target, e).await);
        }
        if self.cancel_requested(&task) {
            let err = OrchestrationError::Cancelled(format!(
                "{action} cancelled after the instance was copied"
            ));
            return Err(self.undo_migration(&task, source, target, err).await);
        }

        let finished_at = Utc::now();
        let parked = self.store.try_update(id, |r| {
            if !self.still_owned(&task, r) {
                return Err(OrchestrationError::Conflict(format!(
                    "task on instance {id} was reset while running"
                )));
            }
            let return_state = r
                .task
                .as_ref()
                .map_or(InstanceState::Active, |m| m.previous_state);
            let stale = r.settle_resize();
            r.resize = Some(ResizeContext {
                kind: action,
                old_footprint: old,
                new_footprint: new,
                source_host: source,
                target_host: target,
                source_allocation: r.allocation,
                target_allocation: selection.reservation,
                return_state,
                finished_at: Some(finished_at),
            });
            r.host = Some(target);
            r.footprint = new;
            r.allocation = Some(selection.reservation);
            r.state = task.plan.on_success;
            if let Some(marker) = r.task.as_mut() {
                // Both allocations now belong to the resize context.
                marker.step = TaskStep::AwaitingConfirmation;
                marker.reservations.clear();
            }
            Ok(stale)
        });
        let record = match parked {
            Ok((stale, record)) => {
                for allocation in stale {
                    self.inventory.release(allocation);
                }
                record
            }
            Err(e) => return Err(self.fail(&task, e, Rollback::Error)),
        };
        self.note(self.actions.finish_action(task.action_id, Ok(())));
        info!(task.log, "awaiting confirmation";
              "source" => %source,
              "target" => %target,
              "footprint" => %new);
        Ok(Outcome::Instance(record.view()))
    }

    /// Discards the target copy of a move that failed part way. The task
    /// ends in `ERROR` if even that does not work.
    async fn undo_migration(
        &self,
        task: &Task,
        source: HostUuid,
        target: HostUuid,
        err: OrchestrationError,
    ) -> OrchestrationError {
        let agent = &self.services.agent;
        let id = task.id;
        let reverted = self
            .event(
                task,
                "revert_migration",
                self.retry.idempotent(&task.log, "revert_migration", || {
                    agent.revert_migration(source, target, id)
                }),
            )
            .await;
        match reverted {
            Ok(()) => self.fail(task, err, Rollback::Restore),
            Err(revert_err) => {
                warn!(task.log, "could not undo migration";
                      "error" => %revert_err);
                self.fail(task, err, Rollback::Error)
            }
        }
    }

    /// Accepts a finished resize or migration, freeing the source host.
    pub async fn confirm_resize(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::ConfirmResize, Some(id), async {
            let task = self.begin(
                ctx,
                id,
                ActionKind::ConfirmResize,
                self.plan_context(ctx),
            )?;
            self.finish_confirm(&task).await.map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    async fn finish_confirm(
        &self,
        task: &Task,
    ) -> Result<InstanceView, OrchestrationError> {
        let Some(resize) = task.record.resize.clone() else {
            let err = OrchestrationError::Fatal(format!(
                "instance {} has no resize context",
                task.id
            ));
            return Err(self.fail(task, err, Rollback::Error));
        };
        let agent = &self.services.agent;
        let id = task.id;
        let confirmed = self
            .event(
                task,
                "confirm_migration",
                self.retry.idempotent(&task.log, "confirm_migration", || {
                    agent.confirm_migration(resize.source_host, id)
                }),
            )
            .await;
        if let Err(e) = confirmed {
            return Err(self.fail(task, e.into(), Rollback::Error));
        }
        if let Some(allocation) = resize.source_allocation {
            self.inventory.release(allocation);
        }
        self.complete(task, |r| r.resize = None)
    }

    /// Returns a resized or migrated instance to its source host and
    /// original footprint, freeing the target.
    pub async fn revert_resize(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::RevertResize, Some(id), async {
            let task = self.begin(
                ctx,
                id,
                ActionKind::RevertResize,
                self.plan_context(ctx),
            )?;
            self.finish_revert(&task).await.map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    async fn finish_revert(
        &self,
        task: &Task,
    ) -> Result<InstanceView, OrchestrationError> {
        let Some(resize) = task.record.resize.clone() else {
            let err = OrchestrationError::Fatal(format!(
                "instance {} has no resize context",
                task.id
            ));
            return Err(self.fail(task, err, Rollback::Error));
        };
        let agent = &self.services.agent;
        let id = task.id;
        let reverted = self
            .event(
                task,
                "revert_migration",
                self.retry.idempotent(&task.log, "revert_migration", || {
                    agent.revert_migration(
                        resize.source_host,
                        resize.target_host,
                        id,
                    )
                }),
            )
            .await;
        if let Err(e) = reverted {
            return Err(self.fail(task, e.into(), Rollback::Error));
        }
        self.inventory.release(resize.target_allocation);
        self.complete(task, |r| {
            r.host = Some(resize.source_host);
            r.footprint = resize.old_footprint;
            r.allocation = resize.source_allocation;
            r.resize = None;
        })
    }

    /// Moves a running instance to another host without stopping it. Naming
    /// the target host is reserved for administrators.
    pub async fn live_migrate(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        target: Option<HostUuid>,
    ) -> Result<InstanceView, OrchestrationError> {
        if target.is_some() && !ctx.is_admin {
            return Err(OrchestrationError::validation(
                "choosing a target host requires an administrator",
            ));
        }
        self.run(ctx, ActionKind::LiveMigrate, Some(id), async {
            let task = self.begin(
                ctx,
                id,
                ActionKind::LiveMigrate,
                self.plan_context(ctx),
            )?;
            let source = match task.host() {
                Ok(host) => host,
                Err(e) => return Err(self.fail(&task, e, Rollback::Restore)),
            };
            let hints = self.move_hints(&task, source, target, false)?;
            let selection = self
                .schedule_move(&task, task.record.footprint, &hints)
                .await?;
            let target = selection.host;

            if self.cancel_requested(&task) {
                return Err(self.abort(&task));
            }
            self.set_step(&task, TaskStep::Executing, None)
                .map_err(|e| self.fail(&task, e, Rollback::Restore))?;
            if let Err(e) = self.inventory.renew(selection.reservation) {
                return Err(self.fail(&task, e.into(), Rollback::Restore));
            }

            let agent = &self.services.agent;
            let migrated = self.retry.non_idempotent(
                &task.log,
                "live_migrate",
                || agent.live_migrate(source, target, id),
                || self.landed(target, id, None),
            );
            if let Err(e) = self.event(&task, "live_migrate", migrated).await {
                return Err(self.fail(&task, e.into(), Rollback::Restore));
            }
            if let Err(e) = self.inventory.commit(selection.reservation) {
                return Err(self.fail(&task, e.into(), Rollback::Error));
            }

            let old = task.record.allocation;
            let view = self.complete(&task, |r| {
                r.host = Some(target);
                r.allocation = Some(selection.reservation);
            })?;
            if let Some(allocation) = old {
                self.inventory.release(allocation);
            }
            Ok(Outcome::Instance(view))
        })
        .await?
        .into_instance()
    }

    /// Puts a host into maintenance and live-migrates every running
    /// instance off it. Each migration runs under its own request ID derived
    /// from the caller's.
    pub async fn drain_host(
        &self,
        ctx: &RequestContext,
        host: HostUuid,
    ) -> Result<DrainReport, OrchestrationError> {
        if !ctx.is_admin {
            return Err(OrchestrationError::validation(
                "draining a host requires an administrator",
            ));
        }
        self.inventory.set_maintenance(host, true)?;

        let resident = self.store.list(&InstanceFilter {
            host: Some(host),
            ..Default::default()
        });
        let mut report = DrainReport::default();
        for record in resident {
            let movable = matches!(
                record.state,
                InstanceState::Active | InstanceState::Paused
            );
            if !movable || record.task.is_some() {
                report.skipped.push(record.id);
                continue;
            }
            let child = RequestContext::admin(ctx.request_id.child(record.id));
            match self.live_migrate(&child, record.id, None).await {
                Ok(_) => report.migrated.push(record.id),
                Err(e) => report.failed.push((record.id, e)),
            }
        }
        info!(self.log, "host drained";
              "host" => %host,
              "migrated" => report.migrated.len(),
              "failed" => report.failed.len(),
              "skipped" => report.skipped.len());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{
        fixture, fixture_with_agent, CoordinatorHandle,
    };
    use super::*;

    use std::time::Duration;

    use corral_types::{RebootKind, RequestId};

    use crate::services::{
        MockHostAgent, PowerState, RemoteInstance, ServiceError,
    };

    fn ctx() -> RequestContext {
        RequestContext::new(RequestId::generate())
    }

    fn admin() -> RequestContext {
        RequestContext::admin(RequestId::generate())
    }

    #[tokio::test]
    async fn confirmed_resizes_free_the_source() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(2, 1024, 10)).await;
        let (id, source) = (view.id, view.host.unwrap());

        let big = Footprint::new(3, 2048, 20);
        let view = c.resize(&ctx(), id, big).await.unwrap();
        assert_eq!(view.state, InstanceState::VerifyResize);
        assert_eq!(view.task_step, Some(TaskStep::AwaitingConfirmation));
        assert_eq!(view.footprint, big);
        let target = view.host.unwrap();
        assert_ne!(target, source);

        // Both copies are paid for until the user decides.
        assert_eq!(c.inventory().usage(source).unwrap().in_use().vcpus, 2);
        assert_eq!(c.inventory().usage(target).unwrap().in_use().vcpus, 3);

        let view = c.confirm_resize(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.task, None);
        assert_eq!(c.inventory().usage(source).unwrap().in_use().vcpus, 0);
        assert_eq!(c.inventory().usage(target).unwrap().in_use().vcpus, 3);
    }

    #[tokio::test]
    async fn reverted_resizes_return_to_the_source() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let small = Footprint::new(1, 512, 5);
        let view = f.create(small).await;
        let (id, source) = (view.id, view.host.unwrap());
        c.stop(&ctx(), id).await.unwrap();

        let view =
            c.resize(&ctx(), id, Footprint::new(2, 1024, 10)).await.unwrap();
        let target = view.host.unwrap();

        let view = c.revert_resize(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Stopped);
        assert_eq!(view.host, Some(source));
        assert_eq!(view.footprint, small);
        assert_eq!(c.inventory().usage(target).unwrap().in_use().vcpus, 0);
        assert_eq!(c.inventory().usage(source).unwrap().in_use().vcpus, 1);
        assert_eq!(f.sim.guest(source, id).unwrap().footprint, small);
        assert!(f.sim.guest(target, id).is_none());

        let err = c.confirm_resize(&ctx(), id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict(_)));
    }

    #[tokio::test]
    async fn failed_resizes_release_the_target_once() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(2, 1024, 10)).await;
        let (id, source) = (view.id, view.host.unwrap());
        let target = *f.hosts.iter().find(|h| **h != source).unwrap();

        f.sim.inject("migrate", ServiceError::Failed("disk full".into()), 1);
        let err = c
            .resize(&ctx(), id, Footprint::new(4, 2048, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ExternalService(_)));

        let view = c.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.host, Some(source));
        assert_eq!(view.task, None);
        assert_eq!(c.inventory().usage(source).unwrap().in_use().vcpus, 2);
        assert_eq!(c.inventory().usage(target).unwrap().in_use().vcpus, 0);
        assert_eq!(c.inventory().allocations_for(id).len(), 1);
    }

    #[tokio::test]
    async fn resizing_to_the_same_footprint_is_invalid() {
        let f = fixture(&[("h1", 4)]);
        let fp = Footprint::new(1, 512, 1);
        let id = f.create(fp).await.id;
        let err = f.coordinator.resize(&ctx(), id, fp).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));

        let view = f.coordinator.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.task, None);
    }

    #[tokio::test]
    async fn repeated_resize_requests_replay_the_first_outcome() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let id = f.create(Footprint::new(1, 512, 1)).await.id;

        let req = ctx();
        let big = Footprint::new(2, 1024, 2);
        let first = c.resize(&req, id, big).await.unwrap();
        assert_eq!(first.state, InstanceState::VerifyResize);

        // The instance now has the new footprint, but the retry is answered
        // from the log rather than checked again.
        let again = c.resize(&req, id, big).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(f.sim.calls("migrate"), 1);

        c.confirm_resize(&ctx(), id).await.unwrap();
        let again = c.resize(&req, id, big).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(c.get(id).unwrap().state, InstanceState::Active);
    }

    #[tokio::test]
    async fn failed_confirms_do_not_strand_the_source_allocation() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, source) = (view.id, view.host.unwrap());
        let usage = |host| c.inventory().usage(host).unwrap().in_use();

        let view =
            c.resize(&ctx(), id, Footprint::new(2, 1024, 2)).await.unwrap();
        let target = view.host.unwrap();

        let down = ServiceError::Unavailable("agent restarting".into());
        f.sim.inject("confirm_migration", down, 3);
        let err = c.confirm_resize(&ctx(), id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ExternalService(_)));

        let view = c.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Error);
        assert_eq!(view.host, Some(target));
        assert_eq!(view.task, None);
        assert!(c.store.get(id).unwrap().resize.is_none());
        assert!(usage(source).is_zero());
        assert_eq!(usage(target).vcpus, 2);

        // The instance can be recovered, moved again and deleted without
        // leaving capacity behind on either host.
        c.reboot(&ctx(), id, RebootKind::Hard).await.unwrap();
        c.resize(&ctx(), id, Footprint::new(3, 1024, 2)).await.unwrap();
        c.confirm_resize(&ctx(), id).await.unwrap();
        c.delete(&ctx(), id).await.unwrap();
        assert!(usage(source).is_zero());
        assert!(usage(target).is_zero());
    }

    #[tokio::test]
    async fn resetting_a_parked_resize_keeps_the_target() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, source) = (view.id, view.host.unwrap());
        let target = c
            .resize(&ctx(), id, Footprint::new(2, 1024, 2))
            .await
            .unwrap()
            .host
            .unwrap();

        let view =
            c.reset_state(&admin(), id, InstanceState::Active).await.unwrap();
        assert_eq!(view.host, Some(target));
        assert_eq!(view.task, None);
        assert!(c.inventory().usage(source).unwrap().in_use().is_zero());
        assert_eq!(c.inventory().usage(target).unwrap().in_use().vcpus, 2);
        assert_eq!(c.inventory().allocations_for(id).len(), 1);

        let err = c.confirm_resize(&ctx(), id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict(_)));
    }

    #[tokio::test]
    async fn moves_cancelled_after_the_copy_return_to_the_source() {
        let footprint = Footprint::new(1, 512, 1);
        let req = RequestId::generate();
        let handle = CoordinatorHandle::default();

        let mut agent = MockHostAgent::new();
        agent.expect_spawn().times(1).returning(|_, _, _, _, _| Ok(()));
        let (cancels, owner) = (handle.clone(), req.clone());
        agent.expect_migrate().times(1).returning(move |_, _, id, _| {
            cancels.get().cancel(id, &owner).unwrap();
            Ok(())
        });
        agent.expect_revert_migration().times(1).returning(|_, _, _| Ok(()));

        let f = fixture_with_agent(&[("h1", 4), ("h2", 4)], agent);
        f.bind(&handle);
        let c = &f.coordinator;
        let view = f.create(footprint).await;
        let (id, source) = (view.id, view.host.unwrap());
        let target = *f.hosts.iter().find(|h| **h != source).unwrap();

        let big = Footprint::new(2, 1024, 2);
        let err = c
            .resize(&RequestContext::new(req.clone()), id, big)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled(_)));

        let view = c.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.host, Some(source));
        assert_eq!(view.footprint, footprint);
        assert_eq!(view.task, None);
        assert_eq!(c.inventory().usage(source).unwrap().in_use(), footprint);
        assert!(c.inventory().usage(target).unwrap().in_use().is_zero());

        let action = c.action(id, &req).unwrap();
        assert_eq!(
            action.result,
            Some(crate::action_log::ActionResult::Error)
        );
    }

    #[tokio::test]
    async fn migration_targets_are_for_admins() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, source) = (view.id, view.host.unwrap());
        let target = *f.hosts.iter().find(|h| **h != source).unwrap();

        let err = c.migrate(&ctx(), id, Some(target)).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));

        let err = c.migrate(&admin(), id, Some(source)).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
        assert_eq!(c.get(id).unwrap().state, InstanceState::Active);

        let view = c.migrate(&admin(), id, Some(target)).await.unwrap();
        assert_eq!(view.host, Some(target));
        assert_eq!(view.state, InstanceState::VerifyResize);
    }

    #[tokio::test]
    async fn live_migration_moves_the_allocation() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(2, 1024, 10)).await;
        let (id, source) = (view.id, view.host.unwrap());
        c.pause(&ctx(), id).await.unwrap();

        let view = c.live_migrate(&ctx(), id, None).await.unwrap();
        let target = view.host.unwrap();
        assert_ne!(target, source);
        assert_eq!(view.state, InstanceState::Paused);
        assert_eq!(c.inventory().usage(source).unwrap().in_use().vcpus, 0);
        assert_eq!(c.inventory().usage(target).unwrap().in_use().vcpus, 2);
    }

    #[tokio::test]
    async fn timed_out_live_migrations_are_checked_not_repeated() {
        let footprint = Footprint::new(1, 512, 1);
        let mut agent = MockHostAgent::new();
        agent.expect_spawn().times(1).returning(|_, _, _, _, _| Ok(()));
        agent.expect_live_migrate().times(1).returning(|_, _, _| {
            Err(ServiceError::Timeout(Duration::from_secs(30)))
        });
        agent.expect_instance_state().times(1).returning(move |_, _| {
            Ok(Some(RemoteInstance { power: PowerState::Running, footprint }))
        });

        let f = fixture_with_agent(&[("h1", 4), ("h2", 4)], agent);
        let view = f.create(footprint).await;
        let source = view.host.unwrap();

        let view = f.coordinator.live_migrate(&ctx(), view.id, None).await;
        let view = view.unwrap();
        assert_ne!(view.host, Some(source));
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.task, None);
    }

    #[tokio::test]
    async fn draining_moves_running_instances() {
        let f = fixture(&[("h1", 8)]);
        let c = &f.coordinator;
        let h1 = f.hosts[0];
        let running = f.create(Footprint::new(1, 512, 1)).await.id;
        let stopped = f.create(Footprint::new(1, 512, 1)).await.id;
        c.stop(&ctx(), stopped).await.unwrap();
        let h2 = c
            .register_host(crate::inventory::HostSpec {
                name: "h2".to_string(),
                cell: "top".parse().unwrap(),
                capacity: Footprint::new(8, 8192, 80),
                capabilities: Default::default(),
            })
            .unwrap();

        let err = c.drain_host(&ctx(), h1).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));

        let report = c.drain_host(&admin(), h1).await.unwrap();
        assert_eq!(report.migrated, vec![running]);
        assert_eq!(report.skipped, vec![stopped]);
        assert!(report.failed.is_empty());
        assert!(c.inventory().host(h1).unwrap().maintenance);
        assert_eq!(c.get(running).unwrap().host, Some(h2));
    }
}
