// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance backups with rotation.

use corral_types::{ActionKind, ImageUuid, InstanceUuid};
use serde::Serialize;
use slog::{info, warn};
use uuid::Uuid;

use super::{Coordinator, Outcome, RequestContext, Rollback, Task};
use crate::error::OrchestrationError;
use crate::instance::{InstanceView, TaskStep};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub instance: InstanceView,
    pub image: ImageUuid,

    /// Older backups deleted to stay within the rotation.
    pub rotated_out: Vec<ImageUuid>,
}

impl Coordinator {
    /// Snapshots the instance's volumes, stores a backup image, and deletes
    /// the oldest backups of the same type beyond the newest `rotation`.
    pub async fn backup(
        &self,
        ctx: &RequestContext,
        id: InstanceUuid,
        name: String,
        backup_type: String,
        rotation: u32,
    ) -> Result<Backup, OrchestrationError> {
        if name.trim().is_empty() || backup_type.trim().is_empty() {
            return Err(OrchestrationError::validation(
                "backup name and type must not be empty",
            ));
        }
        if rotation == 0 {
            return Err(OrchestrationError::validation(
                "rotation must keep at least one backup",
            ));
        }
        let outcome = self
            .run(ctx, ActionKind::Backup, Some(id), async {
                let task = self.begin(
                    ctx,
                    id,
                    ActionKind::Backup,
                    self.plan_context(ctx),
                )?;
                if self.cancel_requested(&task) {
                    return Err(self.abort(&task));
                }
                self.set_step(&task, TaskStep::Executing, None)
                    .map_err(|e| self.fail(&task, e, Rollback::Restore))?;

                let snapshots = self.snapshot_volumes(&task).await?;
                let images = &self.services.images;
                let created = self
                    .event(
                        &task,
                        "create_backup",
                        self.retry.once(images.create_backup(
                            id,
                            name.clone(),
                            backup_type.clone(),
                        )),
                    )
                    .await;
                let image = match created {
                    Ok(image) => image,
                    Err(e) => {
                        self.drop_snapshots(&task, &snapshots).await;
                        let e = OrchestrationError::from(e);
                        return Err(self.fail(&task, e, Rollback::Restore));
                    }
                };
                let rotated_out =
                    self.rotate_backups(&task, &backup_type, rotation).await;
                info!(task.log, "backup created";
                      "image" => %image,
                      "rotated_out" => rotated_out.len());
                let view = self.complete(&task, |_| {})?;
                Ok(Outcome::BackedUp(Backup {
                    instance: view,
                    image,
                    rotated_out,
                }))
            })
            .await?;
        match outcome {
            Outcome::BackedUp(backup) => Ok(backup),
            other => Err(OrchestrationError::Fatal(format!(
                "recorded outcome is not a backup: {other:?}"
            ))),
        }
    }

    /// Snapshots every attached volume. If one fails, the snapshots already
    /// taken are deleted and the task is failed.
    async fn snapshot_volumes(
        &self,
        task: &Task,
    ) -> Result<Vec<Uuid>, OrchestrationError> {
        let volumes = &self.services.volumes;
        let mut snapshots = Vec::new();
        for volume in task.record.volumes.keys() {
            let taken = self
                .event(
                    task,
                    "snapshot_volume",
                    self.retry.once(volumes.create_snapshot(*volume)),
                )
                .await;
            match taken {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    self.drop_snapshots(task, &snapshots).await;
                    return Err(self.fail(task, e.into(), Rollback::Restore));
                }
            }
        }
        Ok(snapshots)
    }

    async fn drop_snapshots(&self, task: &Task, snapshots: &[Uuid]) {
        let volumes = &self.services.volumes;
        for snapshot in snapshots {
            self.best_effort(
                task,
                "delete_snapshot",
                self.retry.once(volumes.delete_snapshot(*snapshot)),
            )
            .await;
        }
    }

    /// Deletes the oldest backups of `backup_type` until `rotation` remain.
    /// Rotation failures are logged; they do not fail the backup.
    async fn rotate_backups(
        &self,
        task: &Task,
        backup_type: &str,
        rotation: u32,
    ) -> Vec<ImageUuid> {
        let images = &self.services.images;
        let id = task.id;
        let listed = self
            .event(
                task,
                "list_backups",
                self.retry.idempotent(&task.log, "list_backups", || {
                    images.list_backups(id, backup_type.to_string())
                }),
            )
            .await;
        let backups = match listed {
            Ok(backups) => backups,
            Err(e) => {
                warn!(task.log, "could not list backups"; "error" => %e);
                return Vec::new();
            }
        };

        let excess = backups.len().saturating_sub(rotation as usize);
        let mut rotated_out = Vec::with_capacity(excess);
        for backup in backups.into_iter().take(excess) {
            let deleted = self
                .event(
                    task,
                    "delete_backup",
                    self.retry.idempotent(&task.log, "delete_image", || {
                        images.delete_image(backup.id)
                    }),
                )
                .await;
            match deleted {
                Ok(()) => rotated_out.push(backup.id),
                Err(e) => {
                    warn!(task.log, "could not delete old backup";
                          "image" => %backup.id,
                          "error" => %e);
                }
            }
        }
        rotated_out
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;

    use corral_types::{Footprint, InstanceState, RequestId};

    use crate::services::ServiceError;

    fn ctx() -> RequestContext {
        RequestContext::new(RequestId::generate())
    }

    #[tokio::test]
    async fn rotation_keeps_the_newest_backups() {
        let f = fixture(&[("h1", 4)]);
        let c = &f.coordinator;
        let id = f.create(Footprint::new(1, 512, 1)).await.id;

        let mut images = Vec::new();
        for n in 0..3 {
            let backup = c
                .backup(&ctx(), id, format!("nightly-{n}"), "daily".into(), 2)
                .await
                .unwrap();
            assert_eq!(backup.instance.state, InstanceState::Active);
            images.push(backup.image);
        }
        // A weekly backup does not count against the daily rotation.
        c.backup(&ctx(), id, "weekly".into(), "weekly".into(), 1)
            .await
            .unwrap();

        let daily: Vec<_> = f
            .sim
            .backups(id)
            .into_iter()
            .filter(|b| b.backup_type == "daily")
            .map(|b| b.id)
            .collect();
        assert_eq!(daily, images[1..]);
        assert_eq!(f.sim.backups(id).len(), 3);
    }

    #[tokio::test]
    async fn failed_snapshots_are_cleaned_up() {
        let f = fixture(&[("h1", 4)]);
        let c = &f.coordinator;
        let id = f.create(Footprint::new(1, 512, 1)).await.id;
        for _ in 0..2 {
            let volume = f.sim.add_volume("nfs");
            c.attach_volume(&ctx(), id, volume, None).await.unwrap();
        }

        f.sim.inject_after(
            "create_snapshot",
            1,
            ServiceError::Failed("quota".into()),
        );
        let err = c
            .backup(&ctx(), id, "b".into(), "daily".into(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ExternalService(_)));
        assert_eq!(f.sim.calls("delete_snapshot"), 1);
        assert_eq!(f.sim.snapshot_count(), 0);
        assert!(f.sim.backups(id).is_empty());

        let view = c.get(id).unwrap();
        assert_eq!(view.state, InstanceState::Active);
        assert_eq!(view.task, None);
    }

    #[tokio::test]
    async fn backups_need_a_positive_rotation() {
        let f = fixture(&[("h1", 4)]);
        let id = f.create(Footprint::new(1, 512, 1)).await.id;
        let err = f
            .coordinator
            .backup(&ctx(), id, "b".into(), "daily".into(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
    }
}
