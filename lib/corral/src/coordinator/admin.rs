// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use corral_types::{
    ActionKind, InstanceState, InstanceUuid, LockedBy, RequestId,
};
use slog::{info, warn};

use super::{Coordinator, Outcome, RequestContext};
use crate::error::OrchestrationError;
use crate::instance::{InstanceView, TaskStep};

impl Coordinator {
    pub async fn lock(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::Lock, Some(id), async {
            let task =
                self.begin(ctx, id, ActionKind::Lock, self.plan_context(ctx))?;
            let by =
                if ctx.is_admin { LockedBy::Admin } else { LockedBy::Owner };
            self.complete(&task, |r| {
                // An owner relocking cannot downgrade an admin lock.
                if by == LockedBy::Admin || r.locked_by.is_none() {
                    r.locked_by = Some(by);
                }
            })
            .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    pub async fn unlock(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::Unlock, Some(id), async {
            let task = self.begin(
                ctx,
                id,
                ActionKind::Unlock,
                self.plan_context(ctx),
            )?;
            self.complete(&task, |r| r.locked_by = None)
                .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    /// Forces an instance into `ACTIVE` or `ERROR`, clearing any task
    /// marker. Reservations held by a cleared task are released.
    pub async fn reset_state(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        state: InstanceState,
    ) -> Result<InstanceView, OrchestrationError> {
        if !matches!(state, InstanceState::Active | InstanceState::Error) {
            return Err(OrchestrationError::validation(format!(
                "cannot reset an instance to {state}"
            )));
        }
        self.run(ctx, ActionKind::ResetState, Some(id), async {
            let task = self.begin(
                ctx,
                id,
                ActionKind::ResetState,
                self.plan_context(ctx),
            )?;
            let ((cleared, stale), record) = self.store.try_update(id, |r| {
                r.state = state;
                if state == InstanceState::Active {
                    r.fault = None;
                }
                let marker = r.task.take();
                Ok::<_, OrchestrationError>((marker, r.settle_resize()))
            })?;
            if let Some(marker) = cleared {
                warn!(task.log, "cleared task marker";
                      "task" => %marker.kind,
                      "step" => %marker.step,
                      "owner" => %marker.request_id);
                for reservation in marker.reservations {
                    self.inventory.release(reservation);
                }
            }
            // The instance stays where the record places it.
            for allocation in stale {
                self.inventory.release(allocation);
            }
            self.note(self.actions.finish_action(task.action_id, Ok(())));
            info!(task.log, "state reset"; "state" => %state);
            Ok(Outcome::Instance(record.view()))
        })
        .await?
        .into_instance()
    }

    /// Asks the task started by `request_id` to stop at its next step
    /// boundary.
    ///
    /// A resize waiting for confirmation has nothing left to stop; revert it
    /// instead.
    pub fn cancel(
        &self,
        id: InstanceUuid,
        request_id: &RequestId,
    ) -> Result<InstanceView, OrchestrationError> {
        let (_, record) = self.store.try_update(id, |r| {
            let marker = r.task.as_mut().ok_or_else(|| {
                OrchestrationError::Conflict(format!(
                    "instance {id} has no task in progress"
                ))
            })?;
            if &marker.request_id != request_id {
                return Err(OrchestrationError::Conflict(format!(
                    "the task on instance {id} belongs to request {}",
                    marker.request_id
                )));
            }
            if marker.step == TaskStep::AwaitingConfirmation {
                return Err(OrchestrationError::Conflict(format!(
                    "the {} of instance {id} is awaiting confirmation",
                    marker.kind
                )));
            }
            marker.cancel_requested = true;
            Ok(())
        })?;
        info!(self.log, "cancellation requested";
              "instance" => %id,
              "request_id" => %request_id);
        Ok(record.view())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;

    use corral_types::Footprint;

    #[tokio::test]
    async fn owners_cannot_lift_admin_locks() {
        let f = fixture(&[("h1", 4)]);
        let coordinator = &f.coordinator;
        let id = f.create(Footprint::new(1, 512, 1)).await.id;

        let owner = || RequestContext::new(RequestId::generate());
        let admin = || RequestContext::admin(RequestId::generate());

        let view = coordinator.lock(&admin(), id).await.unwrap();
        assert!(view.locked);

        let err = coordinator.unlock(&owner(), id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict(_)));
        let err = coordinator.stop(&owner(), id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict(_)));

        // Admins are not bound by locks.
        let view = coordinator.stop(&admin(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Stopped);

        let view = coordinator.unlock(&admin(), id).await.unwrap();
        assert!(!view.locked);
        coordinator.start(&owner(), id).await.unwrap();
    }

    #[tokio::test]
    async fn reset_state_clears_a_stuck_task() {
        let f = fixture(&[("h1", 4)]);
        let coordinator = &f.coordinator;
        let id = f.create(Footprint::new(1, 512, 1)).await.id;

        let stuck = RequestId::generate();
        coordinator.store.update(id, |r| {
            r.state = InstanceState::Rebooting;
            r.task = Some(crate::instance::TaskMarker {
                kind: ActionKind::Reboot,
                step: TaskStep::Executing,
                request_id: stuck.clone(),
                started_at: chrono::Utc::now(),
                cancel_requested: false,
                reservations: Vec::new(),
                previous_state: InstanceState::Active,
            });
        })
        .unwrap();

        let owner = RequestContext::new(RequestId::generate());
        let err = coordinator
            .reset_state(&owner, id, InstanceState::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));

        let admin = RequestContext::admin(RequestId::generate());
        let err = coordinator
            .reset_state(&admin, id, InstanceState::Stopped)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));

        let view = coordinator
            .reset_state(&admin, id, InstanceState::Active)
            .await
            .unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.task, None);
    }

    #[tokio::test]
    async fn only_the_owning_request_can_cancel() {
        let f = fixture(&[("h1", 4)]);
        let coordinator = &f.coordinator;
        let id = f.create(Footprint::new(1, 512, 1)).await.id;

        let err = coordinator.cancel(id, &RequestId::generate()).unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict(_)));

        let running = RequestId::generate();
        coordinator.store.update(id, |r| {
            r.task = Some(crate::instance::TaskMarker {
                kind: ActionKind::Backup,
                step: TaskStep::Accepted,
                request_id: running.clone(),
                started_at: chrono::Utc::now(),
                cancel_requested: false,
                reservations: Vec::new(),
                previous_state: InstanceState::Active,
            });
        })
        .unwrap();

        assert!(coordinator.cancel(id, &RequestId::generate()).is_err());
        coordinator.cancel(id, &running).unwrap();
        let record = coordinator.store.get(id).unwrap();
        assert!(record.task.unwrap().cancel_requested);
    }
}
