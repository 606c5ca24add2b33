// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-call power transitions.

use corral_types::{
    ActionKind, HostUuid, ImageUuid, InstanceUuid, RebootKind,
};

use super::{Coordinator, Outcome, RequestContext, Rollback};
use crate::error::OrchestrationError;
use crate::instance::{InstanceView, PlanContext, TaskStep};
use crate::services::{HostAgent, ServiceError};

/// The host agent call behind a power transition. Every one of them may be
/// repeated safely.
#[derive(Clone, Copy, Debug)]
pub(super) enum PowerCall {
    Reboot(RebootKind),
    PowerOff,
    PowerOn,
    Rescue(ImageUuid),
    Unrescue,
    Pause,
    Unpause,
    Suspend,
    Resume,
}

impl PowerCall {
    pub(super) fn name(&self) -> &'static str {
        match self {
            PowerCall::Reboot(_) => "reboot",
            PowerCall::PowerOff => "power_off",
            PowerCall::PowerOn => "power_on",
            PowerCall::Rescue(_) => "rescue",
            PowerCall::Unrescue => "unrescue",
            PowerCall::Pause => "pause",
            PowerCall::Unpause => "unpause",
            PowerCall::Suspend => "suspend",
            PowerCall::Resume => "resume",
        }
    }

    pub(super) async fn invoke(
        self,
        agent: &dyn HostAgent,
        host: HostUuid,
        instance: InstanceUuid,
    ) -> Result<(), ServiceError> {
        match self {
            PowerCall::Reboot(kind) => agent.reboot(host, instance, kind).await,
            PowerCall::PowerOff => agent.power_off(host, instance).await,
            PowerCall::PowerOn => agent.power_on(host, instance).await,
            PowerCall::Rescue(image) => {
                agent.rescue(host, instance, image).await
            }
            PowerCall::Unrescue => agent.unrescue(host, instance).await,
            PowerCall::Pause => agent.pause(host, instance).await,
            PowerCall::Unpause => agent.unpause(host, instance).await,
            PowerCall::Suspend => agent.suspend(host, instance).await,
            PowerCall::Resume => agent.resume(host, instance).await,
        }
    }
}

impl Coordinator {
    /// Issues `call` to the instance's host, with retries.
    pub(super) async fn power_call(
        &self,
        task: &super::Task,
        host: HostUuid,
        call: PowerCall,
    ) -> Result<(), ServiceError> {
        let agent = self.services.agent.as_ref();
        let id = task.id;
        self.event(
            task,
            call.name(),
            self.retry.idempotent(&task.log, call.name(), || {
                call.invoke(agent, host, id)
            }),
        )
        .await
    }

    async fn power_action(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        action: ActionKind,
        pctx: PlanContext,
        call: PowerCall,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, action, Some(id), async {
            let task = self.begin(ctx, id, action, pctx)?;
            let host = match task.host() {
                Ok(host) => host,
                Err(e) => return Err(self.fail(&task, e, Rollback::Restore)),
            };
            if self.cancel_requested(&task) {
                return Err(self.abort(&task));
            }
            self.set_step(&task, TaskStep::Executing, None)?;
            match self.power_call(&task, host, call).await {
                Ok(()) => self.complete(&task, |_| {}).map(Outcome::Instance),
                Err(e) => Err(self.fail(&task, e.into(), Rollback::Error)),
            }
        })
        .await?
        .into_instance()
    }

    pub async fn reboot(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        kind: RebootKind,
    ) -> Result<InstanceView, OrchestrationError> {
        let pctx = PlanContext { reboot: kind, ..self.plan_context(ctx) };
        self.power_action(
            ctx,
            id,
            ActionKind::Reboot,
            pctx,
            PowerCall::Reboot(kind),
        )
        .await
    }

    pub async fn stop(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        let pctx = self.plan_context(ctx);
        self.power_action(ctx, id, ActionKind::Stop, pctx, PowerCall::PowerOff)
            .await
    }

    pub async fn start(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        let pctx = self.plan_context(ctx);
        self.power_action(ctx, id, ActionKind::Start, pctx, PowerCall::PowerOn)
            .await
    }

    /// Boots the instance from a rescue image, its own image by default.
    pub async fn rescue(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        image: Option<ImageUuid>,
    ) -> Result<InstanceView, OrchestrationError> {
        let image = match image {
            Some(image) => {
                let images = &self.services.images;
                self.retry
                    .idempotent(&self.log, "get_image", || {
                        images.get_image(image)
                    })
                    .await
                    .map_err(|e| match e {
                        ServiceError::NotFound(_) => {
                            OrchestrationError::validation(format!(
                                "rescue image {image} does not exist"
                            ))
                        }
                        e => e.into(),
                    })?;
                image
            }
            None => self.store.get(id)?.image,
        };
        let pctx = self.plan_context(ctx);
        self.power_action(
            ctx,
            id,
            ActionKind::Rescue,
            pctx,
            PowerCall::Rescue(image),
        )
        .await
    }

    pub async fn unrescue(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        let pctx = self.plan_context(ctx);
        self.power_action(
            ctx,
            id,
            ActionKind::Unrescue,
            pctx,
            PowerCall::Unrescue,
        )
        .await
    }

    pub async fn pause(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        let pctx = self.plan_context(ctx);
        self.power_action(ctx, id, ActionKind::Pause, pctx, PowerCall::Pause)
            .await
    }

    pub async fn unpause(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        let pctx = self.plan_context(ctx);
        self.power_action(
            ctx,
            id,
            ActionKind::Unpause,
            pctx,
            PowerCall::Unpause,
        )
        .await
    }

    pub async fn suspend(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        let pctx = self.plan_context(ctx);
        self.power_action(
            ctx,
            id,
            ActionKind::Suspend,
            pctx,
            PowerCall::Suspend,
        )
        .await
    }

    pub async fn resume(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        let pctx = self.plan_context(ctx);
        self.power_action(ctx, id, ActionKind::Resume, pctx, PowerCall::Resume)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;

    use corral_types::{Footprint, InstanceState, RequestId};

    use crate::action_log::ActionResult;
    use crate::services::PowerState;

    fn ctx() -> RequestContext {
        RequestContext::new(RequestId::generate())
    }

    #[tokio::test]
    async fn power_cycle_follows_the_host() {
        let f = fixture(&[("h1", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, host) = (view.id, view.host.unwrap());

        let view = c.pause(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Paused);
        assert_eq!(f.sim.guest(host, id).unwrap().power, PowerState::Paused);

        let err = c.suspend(&ctx(), id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict(_)));

        c.unpause(&ctx(), id).await.unwrap();
        c.suspend(&ctx(), id).await.unwrap();
        let view = c.resume(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Active);

        let view = c.rescue(&ctx(), id, None).await.unwrap();
        assert_eq!(view.state, InstanceState::Rescued);
        let view = c.unrescue(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Active);

        let view = c.reboot(&ctx(), id, RebootKind::Hard).await.unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.task, None);
    }

    #[tokio::test]
    async fn retries_absorb_transient_agent_failures() {
        let f = fixture(&[("h1", 4)]);
        let id = f.create(Footprint::new(1, 512, 1)).await.id;

        f.sim.inject("power_off", ServiceError::Unavailable("busy".into()), 1);
        let view = f.coordinator.stop(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Stopped);
        assert_eq!(f.sim.calls("power_off"), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_the_instance_in_error() {
        let f = fixture(&[("h1", 4)]);
        let id = f.create(Footprint::new(1, 512, 1)).await.id;

        f.sim.inject("reboot", ServiceError::Unavailable("gone".into()), 3);
        let req = ctx();
        let err = f
            .coordinator
            .reboot(&req, id, RebootKind::Soft)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ExternalService(_)));

        let view = f.coordinator.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Error);
        assert!(view.fault.is_some());
        assert_eq!(view.task, None);

        let action = f.coordinator.action(id, &req.request_id).unwrap();
        assert_eq!(action.result, Some(ActionResult::Error));
        assert_eq!(action.events[0].name, "reboot");
        assert_eq!(action.events[0].result, Some(ActionResult::Error));

        // A hard reboot is the way out of ERROR.
        let view = f
            .coordinator
            .reboot(&ctx(), id, RebootKind::Hard)
            .await
            .unwrap();
        assert_eq!(view.state, InstanceState::Active);
    }

    #[tokio::test]
    async fn missing_rescue_images_are_rejected_up_front() {
        let f = fixture(&[("h1", 4)]);
        let id = f.create(Footprint::new(1, 512, 1)).await.id;
        let err = f
            .coordinator
            .rescue(&ctx(), id, Some(ImageUuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
        assert_eq!(f.coordinator.get(id).unwrap().state, InstanceState::Active);
    }
}
