// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deleting, soft-deleting, and restoring instances.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::Utc;
use corral_types::{ActionKind, InstanceState, InstanceUuid};
use slog::{info, warn};

use super::power::PowerCall;
use super::{Coordinator, Outcome, RequestContext, Rollback, Task};
use crate::error::OrchestrationError;
use crate::instance::{InstanceView, TaskStep};

impl Coordinator {
    /// Deletes an instance. With a reclaim interval configured the instance
    /// is only powered off and parked in `SOFT_DELETED`; deleting a
    /// soft-deleted instance removes it for good.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::Delete, Some(id), async {
            let plan_ctx = self.plan_context(ctx);
            let task = self.begin(ctx, id, ActionKind::Delete, plan_ctx)?;
            if task.plan.on_success == InstanceState::SoftDeleted {
                return self.soft_delete(&task).await.map(Outcome::Instance);
            }
            self.teardown(&task).await.map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    async fn soft_delete(
        &self,
        task: &Task,
    ) -> Result<InstanceView, OrchestrationError> {
        if let Some(host) = task.record.host {
            if self.inventory.is_up(host).unwrap_or(false) {
                self.set_step(task, TaskStep::Executing, None)
                    .map_err(|e| self.fail(task, e, Rollback::Restore))?;
                let powered_off = self
                    .power_call(task, host, PowerCall::PowerOff)
                    .await;
                if let Err(e) = powered_off {
                    warn!(task.log, "could not power off"; "error" => %e);
                }
            }
        }
        self.complete(task, |r| r.deleted_at = Some(Utc::now()))
    }

    /// Brings a soft-deleted instance back.
    pub async fn restore(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::Restore, Some(id), async {
            let task = self.begin(
                ctx,
                id,
                ActionKind::Restore,
                self.plan_context(ctx),
            )?;
            if let Some(host) = task.record.host {
                self.set_step(&task, TaskStep::Executing, None)
                    .map_err(|e| self.fail(&task, e, Rollback::Restore))?;
                if let Err(e) =
                    self.power_call(&task, host, PowerCall::PowerOn).await
                {
                    return Err(self.fail(&task, e.into(), Rollback::Error));
                }
            }
            self.complete(&task, |r| r.deleted_at = None)
                .map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    /// Deletes a soft-deleted instance without waiting for the reclaim
    /// interval.
    pub async fn force_delete(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
    ) -> Result<InstanceView, OrchestrationError> {
        self.run(ctx, ActionKind::ForceDelete, Some(id), async {
            let task = self.begin(
                ctx,
                id,
                ActionKind::ForceDelete,
                self.plan_context(ctx),
            )?;
            self.teardown(&task).await.map(Outcome::Instance)
        })
        .await?
        .into_instance()
    }

    /// Destroys the instance and returns everything it held.
    ///
    /// The guest is destroyed first and must succeed if its host is up; an
    /// instance on a down host is deleted locally. Releasing volumes and
    /// addresses is best effort.
    async fn teardown(
        &self,
        task: &Task,
    ) -> Result<InstanceView, OrchestrationError> {
        let id = task.id;
        let record = &task.record;
        self.set_step(task, TaskStep::Executing, None)
            .map_err(|e| self.fail(task, e, Rollback::Restore))?;

        let agent = &self.services.agent;
        if let Some(host) = record.host {
            if self.inventory.is_up(host).unwrap_or(false) {
                let destroyed = self
                    .event(
                        task,
                        "destroy",
                        self.retry.idempotent(&task.log, "destroy", || {
                            agent.destroy(host, id)
                        }),
                    )
                    .await;
                if let Err(e) = destroyed {
                    return Err(self.fail(task, e.into(), Rollback::Error));
                }
            } else {
                info!(task.log, "host is down, deleting locally";
                      "host" => %host);
            }
        }
        if let Some(resize) = &record.resize {
            if record.host != Some(resize.source_host) {
                let source = resize.source_host;
                self.best_effort(
                    task,
                    "destroy_source",
                    self.retry.once(agent.destroy(source, id)),
                )
                .await;
            }
        }

        let volumes = &self.services.volumes;
        for volume in record.volumes.keys() {
            self.best_effort(
                task,
                "detach_volume",
                self.retry.once(volumes.detach(*volume, id)),
            )
            .await;
        }

        let network = &self.services.network;
        for address in &record.floating_ips {
            self.best_effort(
                task,
                "disassociate_floating_ip",
                self.retry.once(network.disassociate_floating_ip(*address, id)),
            )
            .await;
        }
        self.floating_ips.release_instance(id);
        for port in record.ports.keys() {
            self.best_effort(
                task,
                "detach_interface",
                self.retry.once(network.detach_interface(id, *port)),
            )
            .await;
        }
        let port_addresses: BTreeSet<IpAddr> =
            record.ports.values().copied().collect();
        for address in &record.fixed_ips {
            if port_addresses.contains(address) {
                continue;
            }
            self.best_effort(
                task,
                "deallocate_network",
                self.retry.once(network.deallocate_fixed_ip(id, *address)),
            )
            .await;
        }

        let mut allocations: BTreeSet<_> =
            record.allocation.into_iter().collect();
        if let Some(resize) = &record.resize {
            allocations.extend(resize.source_allocation);
            allocations.insert(resize.target_allocation);
        }
        for allocation in allocations {
            self.inventory.release(allocation);
        }

        self.complete(task, |r| {
            r.host = None;
            r.allocation = None;
            r.resize = None;
            r.volumes.clear();
            r.fixed_ips.clear();
            r.floating_ips.clear();
            r.ports.clear();
            r.deleted_at = Some(Utc::now());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, fixture_with};
    use super::*;

    use corral_types::{Footprint, RequestId};

    use crate::services::ServiceError;

    fn ctx() -> RequestContext {
        RequestContext::new(RequestId::generate())
    }

    #[tokio::test]
    async fn deletes_return_capacity_and_addresses() {
        let f = fixture(&[("h1", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(2, 1024, 10)).await;
        let (id, host) = (view.id, view.host.unwrap());

        let view = c.delete(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Deleted);
        assert_eq!(view.host, None);
        assert!(view.fixed_ips.is_empty());
        assert!(view.deleted_at.is_some());
        assert!(c.inventory().usage(host).unwrap().in_use().is_zero());
        assert!(f.sim.guest(host, id).is_none());
        assert_eq!(f.sim.calls("deallocate_fixed_ip"), 1);

        let err = c.delete(&ctx(), id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict(_)));
    }

    #[tokio::test]
    async fn instances_on_down_hosts_are_deleted_locally() {
        let f = fixture(&[("h1", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, host) = (view.id, view.host.unwrap());
        c.inventory().set_forced_down(host, true).unwrap();

        let view = c.delete(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Deleted);
        assert_eq!(f.sim.calls("destroy"), 0);
        assert!(c.inventory().usage(host).unwrap().in_use().is_zero());
    }

    #[tokio::test]
    async fn failed_destroys_leave_the_instance_in_error() {
        let f = fixture(&[("h1", 4)]);
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, host) = (view.id, view.host.unwrap());

        f.sim.inject("destroy", ServiceError::Failed("stuck".into()), 1);
        let err = c.delete(&ctx(), id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ExternalService(_)));
        let view = c.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Error);
        assert_eq!(view.host, Some(host));
        assert_eq!(c.inventory().usage(host).unwrap().in_use().vcpus, 1);

        // Deleting again from ERROR goes through.
        let view = c.delete(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Deleted);
    }

    #[tokio::test]
    async fn soft_deletes_can_be_restored() {
        let f = fixture_with(&[("h1", 4)], |config| {
            config.lifecycle.reclaim_instance_interval_secs = 3600;
        });
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, host) = (view.id, view.host.unwrap());

        let view = c.delete(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::SoftDeleted);
        assert!(view.deleted_at.is_some());
        // The capacity stays claimed until the instance is reclaimed.
        assert_eq!(c.inventory().usage(host).unwrap().in_use().vcpus, 1);

        let view = c.restore(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.deleted_at, None);

        c.delete(&ctx(), id).await.unwrap();
        let view = c.force_delete(&ctx(), id).await.unwrap();
        assert_eq!(view.state, InstanceState::Deleted);
        assert!(c.inventory().usage(host).unwrap().in_use().is_zero());
    }
}
