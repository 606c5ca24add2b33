// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Settling tasks that were interrupted by a restart.
//!
//! A task marker that survives a restart names the step its task had reached.
//! Tasks that had not yet touched anything outside the store are rolled back.
//! Tasks that had issued a host call are settled by asking the host what
//! actually happened: work that landed is completed, work that did not is
//! undone, and anything that cannot be established leaves the instance in
//! `ERROR`. Resizes awaiting confirmation are left alone, and an interrupted
//! confirm or revert is run again.

use chrono::Utc;
use corral_types::{ActionKind, InstanceState, InstanceUuid};
use serde::Serialize;
use slog::{info, o, warn, Logger};

use super::{Coordinator, Evacuation, Outcome, RequestContext};
use crate::error::OrchestrationError;
use crate::instance::{
    InstanceFilter, InstanceRecord, ResizeContext, TaskMarker, TaskStep,
};
use crate::inventory::Allocation;
use crate::retry::RemoteOutcome;

const INTERRUPTED: &str = "interrupted by a restart";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub rolled_back: Vec<InstanceUuid>,
    pub completed: Vec<InstanceUuid>,
    pub failed: Vec<InstanceUuid>,
    pub awaiting_confirmation: Vec<InstanceUuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settled {
    RolledBack,
    Completed,
    Failed,
    Awaiting,
}

impl Coordinator {
    /// Settles every task marker left behind by a previous run. Meant to be
    /// called once at startup, before requests are accepted.
    pub async fn recover_interrupted_tasks(&self) -> RecoveryReport {
        let interrupted = self.store.list(&InstanceFilter {
            with_task: true,
            include_deleted: true,
            ..Default::default()
        });
        let mut report = RecoveryReport::default();
        for record in interrupted {
            let Some(marker) = record.task.clone() else {
                continue;
            };
            let log = self.log.new(o!(
                "instance" => record.id.to_string(),
                "request_id" => marker.request_id.to_string(),
                "action" => marker.kind.to_string(),
                "step" => marker.step.to_string(),
            ));
            let settled = self.settle(&record, &marker, &log).await;
            info!(log, "settled interrupted task"; "outcome" => ?settled);
            match settled {
                Settled::RolledBack => report.rolled_back.push(record.id),
                Settled::Completed => report.completed.push(record.id),
                Settled::Failed => report.failed.push(record.id),
                Settled::Awaiting => {
                    report.awaiting_confirmation.push(record.id);
                    continue;
                }
            }
            let outcome = self.interrupted_outcome(record.id, &marker, settled);
            self.actions.close_interrupted(
                record.id,
                &marker.request_id,
                outcome,
            );
        }
        info!(self.log, "recovery finished";
              "rolled_back" => report.rolled_back.len(),
              "completed" => report.completed.len(),
              "failed" => report.failed.len(),
              "awaiting_confirmation" => report.awaiting_confirmation.len());
        report
    }

    /// What a client retrying the interrupted request will be told.
    fn interrupted_outcome(
        &self,
        id: InstanceUuid,
        marker: &TaskMarker,
        settled: Settled,
    ) -> Result<Outcome, OrchestrationError> {
        let view = match (settled, self.store.get(id)) {
            (Settled::Completed, Ok(record)) => record.view(),
            _ => {
                return Err(OrchestrationError::Cancelled(format!(
                    "{} was interrupted by a restart",
                    marker.kind
                )))
            }
        };
        Ok(match marker.kind {
            ActionKind::Create => Outcome::Instances(vec![view]),
            ActionKind::Evacuate => Outcome::Evacuated(Evacuation {
                instance: view,
                admin_password: None,
            }),
            _ => Outcome::Instance(view),
        })
    }

    async fn settle(
        &self,
        record: &InstanceRecord,
        marker: &TaskMarker,
        log: &Logger,
    ) -> Settled {
        match marker.step {
            TaskStep::AwaitingConfirmation => return Settled::Awaiting,
            TaskStep::Confirming | TaskStep::Reverting => {
                return self.rerun_decision(record.id, marker).await;
            }
            step if !step.has_external_effects() => {
                if marker.kind == ActionKind::Create {
                    self.settle_failed(record.id, marker, "build interrupted");
                    return Settled::Failed;
                }
                let previous = marker.previous_state;
                self.settle_with(record.id, marker, |r| r.state = previous);
                return Settled::RolledBack;
            }
            _ => {}
        }
        match marker.kind {
            ActionKind::Create => self.settle_build(record, marker, log).await,
            ActionKind::Resize | ActionKind::Migrate => {
                self.settle_cold_migration(record, marker, log).await
            }
            ActionKind::LiveMigrate | ActionKind::Evacuate => {
                self.settle_move(record, marker, log).await
            }
            kind => {
                warn!(log, "cannot tell how far the task got"; "task" => %kind);
                self.settle_failed(record.id, marker, INTERRUPTED);
                Settled::Failed
            }
        }
    }

    /// Clears `marker` from the record, if it is still there, and applies
    /// `f`. The marker's reservations are released either way, except for
    /// any `f` adopts through `keep`.
    fn settle_with(
        &self,
        id: InstanceUuid,
        marker: &TaskMarker,
        f: impl FnOnce(&mut InstanceRecord),
    ) -> bool {
        self.settle_keeping(id, marker, None, f)
    }

    fn settle_keeping(
        &self,
        id: InstanceUuid,
        marker: &TaskMarker,
        keep: Option<corral_types::ReservationUuid>,
        f: impl FnOnce(&mut InstanceRecord),
    ) -> bool {
        let settled = self.store.try_update(id, |r| {
            let ours = r
                .task
                .as_ref()
                .is_some_and(|t| t.request_id == marker.request_id);
            if !ours {
                return Err(OrchestrationError::Conflict(format!(
                    "task on instance {id} changed during recovery"
                )));
            }
            r.task = None;
            f(r);
            Ok(r.settle_resize())
        });
        for reservation in &marker.reservations {
            if Some(*reservation) != keep {
                self.inventory.release(*reservation);
            }
        }
        match settled {
            Ok((stale, _)) => {
                for allocation in stale {
                    self.inventory.release(allocation);
                }
                true
            }
            Err(_) => false,
        }
    }

    fn settle_failed(&self, id: InstanceUuid, marker: &TaskMarker, why: &str) {
        let fault = format!("{} {why}", marker.kind);
        let building = marker.kind == ActionKind::Create;
        self.settle_with(id, marker, |r| {
            r.state = InstanceState::Error;
            r.fault = Some(fault);
            if building {
                r.host = None;
            }
        });
    }

    /// The allocation the task had reserved on its destination host.
    fn destination(&self, marker: &TaskMarker) -> Option<Allocation> {
        marker
            .reservations
            .iter()
            .find_map(|r| self.inventory.allocation(*r))
    }

    async fn remote_outcome(
        &self,
        log: &Logger,
        allocation: &Allocation,
        footprint: Option<corral_types::Footprint>,
    ) -> Result<RemoteOutcome, crate::services::ServiceError> {
        let (host, id) = (allocation.host, allocation.consumer);
        self.retry
            .idempotent(log, "instance_state", || {
                self.landed(host, id, footprint)
            })
            .await
    }

    async fn settle_build(
        &self,
        record: &InstanceRecord,
        marker: &TaskMarker,
        log: &Logger,
    ) -> Settled {
        let Some(allocation) = self.destination(marker) else {
            self.settle_failed(record.id, marker, "lost its reservation");
            return Settled::Failed;
        };
        match self.remote_outcome(log, &allocation, None).await {
            Ok(RemoteOutcome::Completed)
                if self.inventory.commit(allocation.id).is_ok() =>
            {
                let host = allocation.host;
                let keep = Some(allocation.id);
                let settled = self.settle_keeping(record.id, marker, keep, |r| {
                    r.state = InstanceState::Active;
                    r.host = Some(host);
                    r.allocation = Some(allocation.id);
                });
                if settled {
                    Settled::Completed
                } else {
                    self.inventory.release(allocation.id);
                    Settled::Failed
                }
            }
            Ok(_) => {
                self.settle_failed(record.id, marker, "never reached its host");
                Settled::Failed
            }
            Err(e) => {
                warn!(log, "could not query host"; "error" => %e);
                self.settle_failed(record.id, marker, INTERRUPTED);
                Settled::Failed
            }
        }
    }

    async fn settle_cold_migration(
        &self,
        record: &InstanceRecord,
        marker: &TaskMarker,
        log: &Logger,
    ) -> Settled {
        let (Some(source), Some(target)) =
            (record.host, self.destination(marker))
        else {
            self.settle_failed(record.id, marker, "lost its reservation");
            return Settled::Failed;
        };
        let new = target.footprint;
        let landed = self.remote_outcome(log, &target, Some(new)).await;
        match landed {
            Ok(RemoteOutcome::Completed)
                if self.inventory.commit(target.id).is_ok() =>
            {
                let parked = self.store.try_update(record.id, |r| {
                    let Some(held) = r.task.as_mut() else {
                        return Err(OrchestrationError::Conflict(
                            "task vanished during recovery".to_string(),
                        ));
                    };
                    if held.request_id != marker.request_id {
                        return Err(OrchestrationError::Conflict(
                            "task changed during recovery".to_string(),
                        ));
                    }
                    held.step = TaskStep::AwaitingConfirmation;
                    held.reservations.clear();
                    let stale = r.settle_resize();
                    r.resize = Some(ResizeContext {
                        kind: marker.kind,
                        old_footprint: r.footprint,
                        new_footprint: new,
                        source_host: source,
                        target_host: target.host,
                        source_allocation: r.allocation,
                        target_allocation: target.id,
                        return_state: marker.previous_state,
                        finished_at: Some(Utc::now()),
                    });
                    r.host = Some(target.host);
                    r.footprint = new;
                    r.allocation = Some(target.id);
                    r.state = InstanceState::VerifyResize;
                    Ok(stale)
                });
                match parked {
                    Ok((stale, _)) => {
                        for allocation in stale {
                            self.inventory.release(allocation);
                        }
                        Settled::Completed
                    }
                    Err(_) => {
                        self.inventory.release(target.id);
                        Settled::Failed
                    }
                }
            }
            Ok(_) => {
                let agent = &self.services.agent;
                let id = record.id;
                let reverted = self
                    .retry
                    .idempotent(log, "revert_migration", || {
                        agent.revert_migration(source, target.host, id)
                    })
                    .await;
                if reverted.is_ok() {
                    let previous = marker.previous_state;
                    self.settle_with(id, marker, |r| r.state = previous);
                    Settled::RolledBack
                } else {
                    self.settle_failed(id, marker, "could not be undone");
                    Settled::Failed
                }
            }
            Err(e) => {
                warn!(log, "could not query host"; "error" => %e);
                self.settle_failed(record.id, marker, INTERRUPTED);
                Settled::Failed
            }
        }
    }

    /// Settles a live migration or evacuation, which either moved the whole
    /// instance or did not move it at all.
    async fn settle_move(
        &self,
        record: &InstanceRecord,
        marker: &TaskMarker,
        log: &Logger,
    ) -> Settled {
        let Some(target) = self.destination(marker) else {
            self.settle_failed(record.id, marker, "lost its reservation");
            return Settled::Failed;
        };
        let resting = match marker.kind {
            ActionKind::Evacuate
                if marker.previous_state != InstanceState::Stopped =>
            {
                InstanceState::Active
            }
            _ => marker.previous_state,
        };
        match self.remote_outcome(log, &target, None).await {
            Ok(RemoteOutcome::Completed)
                if self.inventory.commit(target.id).is_ok() =>
            {
                let old = record.allocation;
                let keep = Some(target.id);
                let settled = self.settle_keeping(record.id, marker, keep, |r| {
                    r.state = resting;
                    r.host = Some(target.host);
                    r.allocation = Some(target.id);
                    r.fault = None;
                });
                if !settled {
                    self.inventory.release(target.id);
                    return Settled::Failed;
                }
                if let Some(old) = old {
                    self.inventory.release(old);
                }
                Settled::Completed
            }
            Ok(_) => {
                let previous = marker.previous_state;
                self.settle_with(record.id, marker, |r| r.state = previous);
                Settled::RolledBack
            }
            Err(e) => {
                warn!(log, "could not query host"; "error" => %e);
                self.settle_failed(record.id, marker, INTERRUPTED);
                Settled::Failed
            }
        }
    }

    /// Puts an interrupted confirm or revert back in front of the user's
    /// decision and runs it again.
    async fn rerun_decision(
        &self,
        id: InstanceUuid,
        marker: &TaskMarker,
    ) -> Settled {
        let rewound = self.store.update(id, |r| {
            if let Some(held) = r.task.as_mut() {
                held.step = TaskStep::AwaitingConfirmation;
                r.state = InstanceState::VerifyResize;
            }
        });
        if rewound.is_err() {
            return Settled::Failed;
        }
        let ctx = RequestContext::internal();
        let result = if marker.step == TaskStep::Confirming {
            self.confirm_resize(&ctx, id).await
        } else {
            self.revert_resize(&ctx, id).await
        };
        match result {
            Ok(_) => Settled::Completed,
            Err(_) => Settled::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;

    use std::collections::BTreeSet;

    use corral_types::{Footprint, RequestId};

    fn marker(
        kind: ActionKind,
        step: TaskStep,
        request_id: &RequestId,
        reservations: Vec<corral_types::ReservationUuid>,
    ) -> TaskMarker {
        TaskMarker {
            kind,
            step,
            request_id: request_id.clone(),
            started_at: Utc::now(),
            cancel_requested: false,
            reservations,
            previous_state: InstanceState::Active,
        }
    }

    #[tokio::test]
    async fn unstarted_moves_roll_back() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let id = view.id;
        let h2 = *f.hosts.iter().find(|h| Some(**h) != view.host).unwrap();
        let held = c
            .inventory()
            .reserve(h2, Footprint::new(2, 1024, 2), id, BTreeSet::new())
            .unwrap();

        let req = RequestId::generate();
        c.actions
            .begin_request(&req, ActionKind::Resize, Some(id))
            .unwrap();
        c.store
            .update(id, |r| {
                r.state = InstanceState::Resizing;
                r.task = Some(marker(
                    ActionKind::Resize,
                    TaskStep::Scheduled,
                    &req,
                    vec![held],
                ));
            })
            .unwrap();

        let report = c.recover_interrupted_tasks().await;
        assert_eq!(report.rolled_back, vec![id]);
        let view = c.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.task, None);
        assert!(c.inventory().usage(h2).unwrap().in_use().is_zero());

        // Retrying the interrupted request reports the interruption.
        let err = c
            .resize(&RequestContext::new(req), id, Footprint::new(2, 1024, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled(_)));
    }

    #[tokio::test]
    async fn builds_are_settled_by_asking_the_host() {
        let f = fixture(&[("h1", 4)]);
        let c = &f.coordinator;
        let host = f.hosts[0];
        let fp = Footprint::new(1, 512, 1);
        let req = RequestId::generate();

        let mut ids = Vec::new();
        for landed in [true, false] {
            let id = InstanceUuid::new_v4();
            let held = c
                .inventory()
                .reserve(host, fp, id, BTreeSet::new())
                .unwrap();
            let mut record =
                InstanceRecord::new(id, "vm".to_string(), fp, f.image);
            record.host = Some(host);
            record.task = Some(marker(
                ActionKind::Create,
                TaskStep::Executing,
                &req,
                vec![held],
            ));
            record.task.as_mut().unwrap().previous_state =
                InstanceState::Building;
            c.store.insert(record).unwrap();
            if landed {
                f.sim.place_guest(host, id, fp);
            }
            ids.push(id);
        }

        let report = c.recover_interrupted_tasks().await;
        assert_eq!(report.completed, vec![ids[0]]);
        assert_eq!(report.failed, vec![ids[1]]);

        let built = c.get(ids[0]).unwrap();
        assert_eq!(built.state, InstanceState::Active);
        let lost = c.get(ids[1]).unwrap();
        assert_eq!(lost.state, InstanceState::Error);
        assert_eq!(lost.host, None);
        assert_eq!(c.inventory().usage(host).unwrap().committed.vcpus, 1);
        assert_eq!(c.inventory().usage(host).unwrap().reserved.vcpus, 0);
    }

    #[tokio::test]
    async fn parked_resizes_are_left_for_the_user() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let req = RequestContext::new(RequestId::generate());
        let id = f.create(Footprint::new(1, 512, 1)).await.id;
        c.resize(&req, id, Footprint::new(2, 1024, 2)).await.unwrap();

        let report = c.recover_interrupted_tasks().await;
        assert_eq!(report.awaiting_confirmation, vec![id]);
        assert_eq!(c.get(id).unwrap().state, InstanceState::VerifyResize);
        c.confirm_resize(&RequestContext::new(RequestId::generate()), id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn interrupted_confirms_run_again() {
        let f = fixture(&[("h1", 4), ("h2", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, source) = (view.id, view.host.unwrap());
        c.resize(
            &RequestContext::new(RequestId::generate()),
            id,
            Footprint::new(2, 1024, 2),
        )
        .await
        .unwrap();
        c.store
            .update(id, |r| {
                r.state = InstanceState::Resizing;
                r.task.as_mut().unwrap().step = TaskStep::Confirming;
            })
            .unwrap();

        let report = c.recover_interrupted_tasks().await;
        assert_eq!(report.completed, vec![id]);
        let view = c.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.task, None);
        assert!(c.inventory().usage(source).unwrap().in_use().is_zero());
    }
}
