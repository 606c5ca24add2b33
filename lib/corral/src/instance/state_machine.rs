// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides which lifecycle requests an instance accepts.
//!
//! [`plan`] is a pure function of the instance's state, lock, and task marker
//! and the requested action. It either denies the request or says which state
//! the instance enters while the task runs, which state it rests in when the
//! task succeeds, and whether the request takes the instance's task marker.
//! The coordinator evaluates the plan and installs the task marker under the
//! instance's lock, so a plan is never acted upon after the record changes
//! underneath it.

use corral_types::{ActionKind, InstanceState, LockedBy, RebootKind};
use thiserror::Error;

use super::{InstanceRecord, TaskStep};

/// Reasons a lifecycle request can be denied.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DenyReason {
    #[error("Instance has a {0} task in progress")]
    TaskInProgress(ActionKind),

    #[error("Cannot {action} an instance in state {state}")]
    InvalidState { action: ActionKind, state: InstanceState },

    #[error("Instance is locked")]
    Locked,

    #[error("Instance has no resize awaiting confirmation")]
    NoResizePending,

    #[error("{0} requires an administrator")]
    AdminRequired(ActionKind),
}

/// Request details that affect legality.
#[derive(Clone, Copy, Debug)]
pub struct PlanContext {
    pub is_admin: bool,
    pub reboot: RebootKind,

    /// Deletes move the instance to `SOFT_DELETED` instead of `DELETED`.
    pub soft_delete: bool,
}

impl Default for PlanContext {
    fn default() -> Self {
        Self { is_admin: false, reboot: RebootKind::Soft, soft_delete: false }
    }
}

/// How a request interacts with the task marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskUse {
    /// The request completes without holding the instance.
    None,

    /// The request must take the (currently free) task marker.
    Acquire,

    /// The request continues the task that is already held.
    Continue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plan {
    pub action: ActionKind,
    pub task: TaskUse,
    pub during: InstanceState,
    pub on_success: InstanceState,
}

fn check_lock(
    record: &InstanceRecord,
    action: ActionKind,
    ctx: &PlanContext,
) -> Result<(), DenyReason> {
    match (action, record.locked_by) {
        (_, None) => Ok(()),
        (_, Some(_)) if ctx.is_admin => Ok(()),
        (ActionKind::Lock, Some(_)) => Ok(()),
        (ActionKind::Unlock, Some(LockedBy::Owner)) => Ok(()),
        (_, Some(_)) => Err(DenyReason::Locked),
    }
}

/// Decides whether `record` accepts `action`.
pub fn plan(
    record: &InstanceRecord,
    action: ActionKind,
    ctx: &PlanContext,
) -> Result<Plan, DenyReason> {
    use InstanceState::*;

    let state = record.state;
    let invalid = Err(DenyReason::InvalidState { action, state });

    if action == ActionKind::ResetState {
        if !ctx.is_admin {
            return Err(DenyReason::AdminRequired(action));
        }
        if state.is_deleted() {
            return invalid;
        }
        return Ok(Plan {
            action,
            task: TaskUse::None,
            during: state,
            on_success: state,
        });
    }

    if state.is_deleted() {
        return invalid;
    }
    check_lock(record, action, ctx)?;

    if matches!(action, ActionKind::Lock | ActionKind::Unlock) {
        return Ok(Plan {
            action,
            task: TaskUse::None,
            during: state,
            on_success: state,
        });
    }

    if matches!(action, ActionKind::ConfirmResize | ActionKind::RevertResize) {
        let awaiting = record.task.as_ref().is_some_and(|t| {
            matches!(t.kind, ActionKind::Resize | ActionKind::Migrate)
                && t.step == TaskStep::AwaitingConfirmation
        });
        return match (&record.task, &record.resize) {
            (Some(_), Some(resize)) if awaiting && state == VerifyResize => {
                Ok(Plan {
                    action,
                    task: TaskUse::Continue,
                    during: Resizing,
                    on_success: resize.return_state,
                })
            }
            (Some(task), _) if !awaiting => {
                Err(DenyReason::TaskInProgress(task.kind))
            }
            _ => Err(DenyReason::NoResizePending),
        };
    }

    if let Some(task) = &record.task {
        return Err(DenyReason::TaskInProgress(task.kind));
    }

    let in_any = |states: &[InstanceState]| states.contains(&state);
    let error_with_host = state == Error && record.host.is_some();
    let attachable = [Active, Stopped, Paused, Suspended, Rescued];

    let (allowed, during, on_success) = match action {
        ActionKind::Reboot => match ctx.reboot {
            RebootKind::Soft => (state == Active, Rebooting, Active),
            RebootKind::Hard => (
                in_any(&[Active, Paused, Suspended, Stopped])
                    || error_with_host,
                Rebooting,
                Active,
            ),
        },
        ActionKind::Stop => {
            (in_any(&[Active, Rescued]) || error_with_host, state, Stopped)
        }
        ActionKind::Start => (state == Stopped, state, Active),
        ActionKind::Rescue => (in_any(&[Active, Stopped]), state, Rescued),
        ActionKind::Unrescue => (state == Rescued, state, Active),
        ActionKind::Pause => (state == Active, state, Paused),
        ActionKind::Unpause => (state == Paused, state, Active),
        ActionKind::Suspend => (state == Active, state, Suspended),
        ActionKind::Resume => (state == Suspended, state, Active),
        ActionKind::Resize => {
            (in_any(&[Active, Stopped]), Resizing, VerifyResize)
        }
        ActionKind::Migrate => {
            (in_any(&[Active, Stopped]), Migrating, VerifyResize)
        }
        ActionKind::LiveMigrate => {
            (in_any(&[Active, Paused]), Migrating, state)
        }
        ActionKind::Evacuate => (
            in_any(&[Active, Stopped]) || error_with_host,
            Migrating,
            if state == Stopped { Stopped } else { Active },
        ),
        ActionKind::Backup => {
            (in_any(&[Active, Stopped, Paused, Suspended]), state, state)
        }
        ActionKind::AttachVolume
        | ActionKind::DetachVolume
        | ActionKind::AttachInterface
        | ActionKind::DetachInterface
        | ActionKind::AssociateFloatingIp
        | ActionKind::DisassociateFloatingIp => {
            (in_any(&attachable), state, state)
        }
        ActionKind::Delete => {
            let soft = ctx.soft_delete && state != SoftDeleted;
            let resting = if soft { SoftDeleted } else { Deleted };
            (state != Deleting, Deleting, resting)
        }
        ActionKind::Restore => (state == SoftDeleted, state, Active),
        ActionKind::ForceDelete => (state == SoftDeleted, Deleting, Deleted),

        // Creation never plans against an existing record; the remaining
        // verbs were handled above.
        ActionKind::Create
        | ActionKind::Lock
        | ActionKind::Unlock
        | ActionKind::ConfirmResize
        | ActionKind::RevertResize
        | ActionKind::ResetState => (false, state, state),
    };

    if !allowed {
        return invalid;
    }
    Ok(Plan { action, task: TaskUse::Acquire, during, on_success })
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use corral_types::{
        Footprint, HostUuid, ImageUuid, InstanceUuid, RequestId,
    };
    use strum::IntoEnumIterator;

    use crate::instance::TaskMarker;

    fn record(state: InstanceState) -> InstanceRecord {
        let mut r = InstanceRecord::new(
            InstanceUuid::new_v4(),
            "vm".to_string(),
            Footprint::new(1, 512, 1),
            ImageUuid::new_v4(),
        );
        r.state = state;
        r.host = Some(HostUuid::new_v4());
        r
    }

    fn marker(kind: ActionKind, step: TaskStep) -> TaskMarker {
        TaskMarker {
            kind,
            step,
            request_id: RequestId::generate(),
            started_at: Utc::now(),
            cancel_requested: false,
            reservations: Vec::new(),
            previous_state: InstanceState::Active,
        }
    }

    fn ctx() -> PlanContext {
        PlanContext::default()
    }

    #[test]
    fn resize_from_building_is_illegal() {
        let r = record(InstanceState::Building);
        assert_eq!(
            plan(&r, ActionKind::Resize, &ctx()),
            Err(DenyReason::InvalidState {
                action: ActionKind::Resize,
                state: InstanceState::Building
            })
        );
    }

    #[test]
    fn any_held_task_denies_new_tasks() {
        for state in InstanceState::iter().filter(|s| !s.is_deleted()) {
            let mut r = record(state);
            r.task = Some(marker(ActionKind::Resize, TaskStep::Executing));
            for action in [
                ActionKind::Delete,
                ActionKind::Reboot,
                ActionKind::Stop,
                ActionKind::Resize,
                ActionKind::Evacuate,
            ] {
                assert_eq!(
                    plan(&r, action, &ctx()),
                    Err(DenyReason::TaskInProgress(ActionKind::Resize)),
                    "{action} in {state}"
                );
            }
        }
    }

    #[test]
    fn soft_and_hard_reboot_differ() {
        let r = record(InstanceState::Stopped);
        assert!(plan(&r, ActionKind::Reboot, &ctx()).is_err());
        let hard = PlanContext { reboot: RebootKind::Hard, ..ctx() };
        let p = plan(&r, ActionKind::Reboot, &hard).unwrap();
        assert_eq!(p.during, InstanceState::Rebooting);
        assert_eq!(p.on_success, InstanceState::Active);
    }

    #[test]
    fn error_state_recovery_needs_a_host() {
        let hard = PlanContext { reboot: RebootKind::Hard, ..ctx() };
        let mut r = record(InstanceState::Error);
        assert!(plan(&r, ActionKind::Reboot, &hard).is_ok());
        assert!(plan(&r, ActionKind::Evacuate, &ctx()).is_ok());

        r.host = None;
        assert!(plan(&r, ActionKind::Reboot, &hard).is_err());
        assert!(plan(&r, ActionKind::Evacuate, &ctx()).is_err());
        assert!(plan(&r, ActionKind::Stop, &ctx()).is_err());
        assert!(plan(&r, ActionKind::Delete, &ctx()).is_ok());
    }

    #[test]
    fn confirm_continues_a_held_resize() {
        let mut r = record(InstanceState::VerifyResize);
        assert_eq!(
            plan(&r, ActionKind::ConfirmResize, &ctx()),
            Err(DenyReason::NoResizePending)
        );

        r.task =
            Some(marker(ActionKind::Resize, TaskStep::AwaitingConfirmation));
        r.resize = Some(crate::instance::ResizeContext {
            kind: ActionKind::Resize,
            old_footprint: Footprint::new(1, 512, 1),
            new_footprint: Footprint::new(2, 1024, 1),
            source_host: HostUuid::new_v4(),
            target_host: HostUuid::new_v4(),
            source_allocation: None,
            target_allocation: corral_types::ReservationUuid::new_v4(),
            return_state: InstanceState::Stopped,
            finished_at: None,
        });
        let p = plan(&r, ActionKind::RevertResize, &ctx()).unwrap();
        assert_eq!(p.task, TaskUse::Continue);
        assert_eq!(p.on_success, InstanceState::Stopped);

        // The held task still blocks everything else, including delete.
        assert_eq!(
            plan(&r, ActionKind::Delete, &ctx()),
            Err(DenyReason::TaskInProgress(ActionKind::Resize))
        );
    }

    #[test]
    fn confirm_during_copy_is_a_conflict() {
        let mut r = record(InstanceState::Resizing);
        r.task = Some(marker(ActionKind::Resize, TaskStep::Executing));
        assert_eq!(
            plan(&r, ActionKind::ConfirmResize, &ctx()),
            Err(DenyReason::TaskInProgress(ActionKind::Resize))
        );
    }

    #[test]
    fn locks_bind_owners_but_not_admins() {
        let mut r = record(InstanceState::Active);
        r.locked_by = Some(LockedBy::Admin);
        assert_eq!(
            plan(&r, ActionKind::Stop, &ctx()),
            Err(DenyReason::Locked)
        );
        assert_eq!(
            plan(&r, ActionKind::Unlock, &ctx()),
            Err(DenyReason::Locked)
        );
        let admin = PlanContext { is_admin: true, ..ctx() };
        assert!(plan(&r, ActionKind::Stop, &admin).is_ok());

        r.locked_by = Some(LockedBy::Owner);
        let p = plan(&r, ActionKind::Unlock, &ctx()).unwrap();
        assert_eq!(p.task, TaskUse::None);
    }

    #[test]
    fn delete_honours_reclaim_window() {
        let r = record(InstanceState::Active);
        let soft = PlanContext { soft_delete: true, ..ctx() };
        assert_eq!(
            plan(&r, ActionKind::Delete, &soft).unwrap().on_success,
            InstanceState::SoftDeleted
        );
        assert_eq!(
            plan(&r, ActionKind::Delete, &ctx()).unwrap().on_success,
            InstanceState::Deleted
        );

        let r = record(InstanceState::SoftDeleted);
        assert_eq!(
            plan(&r, ActionKind::Delete, &soft).unwrap().on_success,
            InstanceState::Deleted
        );
        assert!(plan(&r, ActionKind::Restore, &ctx()).is_ok());
        assert!(plan(&r, ActionKind::ForceDelete, &ctx()).is_ok());
        let active = record(InstanceState::Active);
        assert!(plan(&active, ActionKind::Restore, &ctx()).is_err());
    }

    #[test]
    fn deleted_instances_accept_nothing() {
        let r = record(InstanceState::Deleted);
        let admin = PlanContext { is_admin: true, ..ctx() };
        for action in [
            ActionKind::Delete,
            ActionKind::Lock,
            ActionKind::ResetState,
            ActionKind::Restore,
        ] {
            assert!(plan(&r, action, &admin).is_err(), "{action}");
        }
    }

    #[test]
    fn reset_state_ignores_task_and_lock() {
        let mut r = record(InstanceState::Migrating);
        r.task = Some(marker(ActionKind::Evacuate, TaskStep::Executing));
        r.locked_by = Some(LockedBy::Admin);
        assert_eq!(
            plan(&r, ActionKind::ResetState, &ctx()),
            Err(DenyReason::AdminRequired(ActionKind::ResetState))
        );
        let admin = PlanContext { is_admin: true, ..ctx() };
        assert_eq!(
            plan(&r, ActionKind::ResetState, &admin).unwrap().task,
            TaskUse::None
        );
    }

    #[test]
    fn attachments_keep_the_current_state() {
        for state in [
            InstanceState::Active,
            InstanceState::Stopped,
            InstanceState::Paused,
            InstanceState::Suspended,
            InstanceState::Rescued,
        ] {
            let p = plan(&record(state), ActionKind::AttachVolume, &ctx())
                .unwrap();
            assert_eq!(p.during, state);
            assert_eq!(p.on_success, state);
        }
        assert!(plan(
            &record(InstanceState::Error),
            ActionKind::AssociateFloatingIp,
            &ctx()
        )
        .is_err());
    }
}
