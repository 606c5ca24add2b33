// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The periodic maintenance pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_types::{InstanceState, InstanceUuid};
use serde::Serialize;
use slog::{debug, info, warn};
use tokio::task::JoinHandle;

use super::{Coordinator, RequestContext};
use crate::instance::InstanceFilter;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reaped_reservations: usize,
    pub confirmed: Vec<InstanceUuid>,
    pub reclaimed: Vec<InstanceUuid>,
    pub purged: Vec<InstanceUuid>,

    /// Finished requests dropped from the log because no instance keeps
    /// them alive.
    pub expired_requests: usize,
}

impl MaintenanceReport {
    fn is_empty(&self) -> bool {
        self.reaped_reservations == 0
            && self.confirmed.is_empty()
            && self.reclaimed.is_empty()
            && self.purged.is_empty()
            && self.expired_requests == 0
    }
}

/// Returns true if `age` has passed since `at`, as of `now`.
fn elapsed(at: DateTime<Utc>, age: Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| at.checked_add_signed(age))
        .is_some_and(|deadline| deadline <= now)
}

impl Coordinator {
    /// Runs one maintenance pass as of `now`:
    ///
    /// 1. reservations whose TTL has lapsed are released,
    /// 2. resizes left unconfirmed past the confirm window are confirmed,
    /// 3. soft-deleted instances past the reclaim interval are deleted,
    /// 4. deleted records past their retention are purged, along with their
    ///    entries in the action log, and
    /// 5. finished creates that left no instance behind are dropped from the
    ///    request table once they are as old as the retention.
    pub async fn run_maintenance(
        &self,
        now: DateTime<Utc>,
    ) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            reaped_reservations: self.inventory.reap_expired().len(),
            ..Default::default()
        };

        if let Some(window) = self.timers.resize_confirm_window {
            let waiting = self.store.list(&InstanceFilter {
                state: Some(InstanceState::VerifyResize),
                ..Default::default()
            });
            for record in waiting {
                let due = record
                    .resize
                    .as_ref()
                    .and_then(|r| r.finished_at)
                    .is_some_and(|at| elapsed(at, window, now));
                if !due {
                    continue;
                }
                let ctx = RequestContext::internal();
                match self.confirm_resize(&ctx, record.id).await {
                    Ok(_) => report.confirmed.push(record.id),
                    Err(e) => warn!(self.log, "could not auto-confirm resize";
                                    "instance" => %record.id,
                                    "error" => %e),
                }
            }
        }

        if let Some(interval) = self.timers.reclaim_interval {
            let parked = self.store.list(&InstanceFilter {
                state: Some(InstanceState::SoftDeleted),
                include_deleted: true,
                ..Default::default()
            });
            for record in parked {
                let due = record
                    .deleted_at
                    .is_some_and(|at| elapsed(at, interval, now));
                if !due || record.task.is_some() {
                    continue;
                }
                let ctx = RequestContext::internal();
                match self.force_delete(&ctx, record.id).await {
                    Ok(_) => report.reclaimed.push(record.id),
                    Err(e) => warn!(self.log, "could not reclaim instance";
                                    "instance" => %record.id,
                                    "error" => %e),
                }
            }
        }

        let deleted = self.store.list(&InstanceFilter {
            state: Some(InstanceState::Deleted),
            include_deleted: true,
            ..Default::default()
        });
        let retention = self.timers.deleted_retention;
        for record in deleted {
            let due = record
                .deleted_at
                .is_some_and(|at| elapsed(at, retention, now));
            if due && record.task.is_none() {
                self.store.remove(record.id);
                report.purged.push(record.id);
            }
        }
        self.actions.forget_instances(&report.purged);
        if let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        {
            report.expired_requests = self.actions.expire_requests(cutoff);
        }

        if report.is_empty() {
            debug!(self.log, "maintenance pass found nothing to do");
        } else {
            info!(self.log, "maintenance pass finished";
                  "reaped_reservations" => report.reaped_reservations,
                  "confirmed" => report.confirmed.len(),
                  "reclaimed" => report.reclaimed.len(),
                  "purged" => report.purged.len(),
                  "expired_requests" => report.expired_requests);
        }
        report
    }
}

/// Runs [`Coordinator::run_maintenance`] every maintenance interval until the
/// returned task is aborted.
pub fn spawn_maintenance(coordinator: Arc<Coordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(coordinator.maintenance_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            coordinator.run_maintenance(Utc::now()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture_with;
    use super::super::CreateRequest;
    use super::*;

    use std::collections::BTreeSet;

    use corral_types::{Footprint, RequestId};

    use crate::error::OrchestrationError;

    fn ctx() -> RequestContext {
        RequestContext::new(RequestId::generate())
    }

    fn later(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn lapsed_reservations_are_reaped() {
        let f = fixture_with(&[("h1", 4)], |config| {
            config.inventory.reservation_ttl_secs = 0;
        });
        let c = &f.coordinator;
        c.inventory()
            .reserve(
                f.hosts[0],
                Footprint::new(2, 1024, 1),
                InstanceUuid::new_v4(),
                BTreeSet::new(),
            )
            .unwrap();

        let report = c.run_maintenance(Utc::now()).await;
        assert_eq!(report.reaped_reservations, 1);
        assert!(c.inventory().usage(f.hosts[0]).unwrap().in_use().is_zero());
    }

    #[tokio::test]
    async fn unconfirmed_resizes_are_confirmed_after_the_window() {
        let f = fixture_with(&[("h1", 4), ("h2", 4)], |config| {
            config.lifecycle.resize_confirm_window_secs = 60;
        });
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, source) = (view.id, view.host.unwrap());
        c.resize(&ctx(), id, Footprint::new(2, 1024, 2)).await.unwrap();

        let report = c.run_maintenance(Utc::now()).await;
        assert!(report.confirmed.is_empty());
        assert_eq!(c.get(id).unwrap().state, InstanceState::VerifyResize);

        let report = c.run_maintenance(later(120)).await;
        assert_eq!(report.confirmed, vec![id]);
        assert_eq!(c.get(id).unwrap().state, InstanceState::Active);
        assert!(c.inventory().usage(source).unwrap().in_use().is_zero());
    }

    #[tokio::test]
    async fn soft_deletes_are_reclaimed_then_purged() {
        let f = fixture_with(&[("h1", 4)], |config| {
            config.lifecycle.reclaim_instance_interval_secs = 60;
            config.lifecycle.deleted_retention_secs = 3600;
        });
        let c = &f.coordinator;
        let view = f.create(Footprint::new(1, 512, 1)).await;
        let (id, host) = (view.id, view.host.unwrap());
        c.delete(&ctx(), id).await.unwrap();

        let report = c.run_maintenance(later(120)).await;
        assert_eq!(report.reclaimed, vec![id]);
        assert!(report.purged.is_empty());
        assert_eq!(c.get(id).unwrap().state, InstanceState::Deleted);
        assert!(c.inventory().usage(host).unwrap().in_use().is_zero());

        let report = c.run_maintenance(later(7200)).await;
        assert_eq!(report.purged, vec![id]);
        assert!(matches!(c.get(id), Err(OrchestrationError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_create_requests_expire_with_the_retention() {
        let f = fixture_with(&[("h1", 1)], |config| {
            config.lifecycle.deleted_retention_secs = 3600;
        });
        let c = &f.coordinator;
        let req = ctx();
        let request =
            CreateRequest::new("big", Footprint::new(4, 512, 1), f.image);
        assert!(c.create(&req, request.clone()).await.is_err());

        let report = c.run_maintenance(Utc::now()).await;
        assert_eq!(report.expired_requests, 0);
        let report = c.run_maintenance(later(7200)).await;
        assert_eq!(report.expired_requests, 1);

        // The request ID is free again, so a retry is scheduled afresh.
        let err = c.create(&req, request).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NoValidHost(_)));
    }
}
