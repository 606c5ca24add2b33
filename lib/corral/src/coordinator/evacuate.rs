// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rebuilding instances from a failed host somewhere else.

use corral_types::{ActionKind, HostUuid, InstanceState, InstanceUuid};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use slog::info;

use super::power::PowerCall;
use super::{Coordinator, Outcome, RequestContext, Rollback};
use crate::error::OrchestrationError;
use crate::instance::{InstanceView, TaskStep};
use crate::scheduler::SchedulerHints;

const GENERATED_PASSWORD_LEN: usize = 12;

/// The result of an evacuation. A rebuild that did not come from shared
/// storage sets a new administrator password, which is returned here and
/// nowhere else.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Evacuation {
    pub instance: InstanceView,
    pub admin_password: Option<String>,
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

impl Coordinator {
    /// Rebuilds an instance whose host is down on another host.
    ///
    /// Evacuating from a host that is still up is refused without touching
    /// the instance, since the original copy may still be running.
    pub async fn evacuate(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        target: Option<HostUuid>,
        on_shared_storage: bool,
        admin_password: Option<String>,
    ) -> Result<Evacuation, OrchestrationError> {
        if on_shared_storage && admin_password.is_some() {
            return Err(OrchestrationError::validation(
                "an instance rebuilt from shared storage keeps its password",
            ));
        }
        let outcome = self
            .run(ctx, ActionKind::Evacuate, Some(id), async {
                let record = self.store.get(id)?;
                if let Some(source) = record.host {
                    if self.inventory.is_up(source).unwrap_or(false) {
                        let err = OrchestrationError::Precondition(format!(
                            "host {source} of instance {id} is still up"
                        ));
                        return Err(self.reject(
                            ctx,
                            id,
                            ActionKind::Evacuate,
                            err,
                        ));
                    }
                    if let Some(target) = target {
                        if let Err(e) = self.validate_target(source, target) {
                            return Err(self.reject(
                                ctx,
                                id,
                                ActionKind::Evacuate,
                                e,
                            ));
                        }
                    }
                }
                let password = admin_password.clone();
                let shared = on_shared_storage;
                self.rebuild_elsewhere(ctx, id, target, shared, password).await
            })
            .await?;
        match outcome {
            Outcome::Evacuated(evacuation) => Ok(evacuation),
            other => Err(OrchestrationError::Fatal(format!(
                "recorded outcome is not an evacuation: {other:?}"
            ))),
        }
    }

    async fn rebuild_elsewhere(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        target: Option<HostUuid>,
        on_shared_storage: bool,
        admin_password: Option<String>,
    ) -> Result<Outcome, OrchestrationError> {
        let task =
            self.begin(ctx, id, ActionKind::Evacuate, self.plan_context(ctx))?;
        let source = match task.host() {
            Ok(host) => host,
            Err(e) => return Err(self.fail(&task, e, Rollback::Restore)),
        };
        let mut hints = SchedulerHints::default();
        hints.ignore_hosts.insert(source);
        hints.force_hosts.extend(target);
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

        let password = if on_shared_storage {
            None
        } else {
            Some(admin_password.unwrap_or_else(generate_password))
        };
        let agent = &self.services.agent;
        let (footprint, image) = (task.record.footprint, task.record.image);
        let rebuilt = self.retry.non_idempotent(
            &task.log,
            "rebuild",
            || {
                agent.rebuild(
                    target,
                    id,
                    footprint,
                    image,
                    on_shared_storage,
                    password.clone(),
                )
            },
            || self.landed(target, id, None),
        );
        if let Err(e) = self.event(&task, "rebuild", rebuilt).await {
            return Err(self.fail(&task, e.into(), Rollback::Error));
        }
        if task.plan.on_success == InstanceState::Stopped {
            if let Err(e) =
                self.power_call(&task, target, PowerCall::PowerOff).await
            {
                return Err(self.fail(&task, e.into(), Rollback::Error));
            }
        }
        if let Err(e) = self.inventory.commit(selection.reservation) {
            return Err(self.fail(&task, e.into(), Rollback::Error));
        }

        let old = task.record.allocation;
        let view = self.complete(&task, |r| {
            r.host = Some(target);
            r.allocation = Some(selection.reservation);
            r.fault = None;
        })?;
        if let Some(allocation) = old {
            self.inventory.release(allocation);
        }
        info!(task.log, "evacuated"; "from" => %source, "to" => %target);
        Ok(Outcome::Evacuated(Evacuation {
            instance: view,
            admin_password: password,
        }))
    }
}
