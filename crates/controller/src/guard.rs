//! Readiness guard.
//!
//! Checked before the lock is requested: if the cloud is still settling a
//! previous operation, the cycle ends without touching anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ess_cloud::{
    ComputeBackend, DesiredStatus, SnapshotFilter, SnapshotState, StorageBackend, Task,
    TaskStatus,
};
use tracing::info;

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::tags::TagSchema;

/// Work the guard found still in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InFlight {
    /// A managed snapshot is still being taken.
    PendingSnapshot { snapshot_id: String },
    /// A replica task is moving between stable states.
    TransitionalTask {
        task_arn: String,
        status: TaskStatus,
    },
    /// A replica task stopped within the grace window.
    RecentlyStopped { task_arn: String },
}

/// Detects cloud-side operations that have not settled yet.
pub struct ReadinessGuard {
    compute: Arc<dyn ComputeBackend>,
    storage: Arc<dyn StorageBackend>,
    config: Arc<ControllerConfig>,
    tags: TagSchema,
}

impl ReadinessGuard {
    /// Create a guard for the configured replica set.
    #[must_use]
    pub fn new(
        compute: Arc<dyn ComputeBackend>,
        storage: Arc<dyn StorageBackend>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        let tags = TagSchema::new(&config.set_name);
        Self {
            compute,
            storage,
            config,
            tags,
        }
    }

    /// Whether any operation is still in flight.
    ///
    /// # Errors
    /// Returns an error if a backend lookup fails.
    pub async fn has_in_flight(&self) -> Result<bool> {
        Ok(self.in_flight().await?.is_some())
    }

    /// The first in-flight operation found, if any.
    ///
    /// # Errors
    /// Returns an error if a backend lookup fails.
    pub async fn in_flight(&self) -> Result<Option<InFlight>> {
        let pending = self
            .storage
            .describe_snapshots(
                &SnapshotFilter::default()
                    .with_tag(self.tags.managed_key(), "true")
                    .with_state(SnapshotState::Pending),
            )
            .await?;
        if let Some(snapshot) = pending.first() {
            info!(snapshot_id = %snapshot.id, "Snapshot still in progress, skipping this run");
            return Ok(Some(InFlight::PendingSnapshot {
                snapshot_id: snapshot.id.clone(),
            }));
        }

        let cluster = &self.config.cluster;
        let mut arns = self.compute.list_tasks(cluster, DesiredStatus::Stopped).await?;
        arns.extend(self.compute.list_tasks(cluster, DesiredStatus::Running).await?);
        if arns.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let found = self
            .compute
            .describe_tasks(cluster, &arns)
            .await?
            .into_iter()
            .filter(|task| self.tags.index_of(&task.tags).is_some())
            .find_map(|task| classify(&task, now, self.config.timings.in_flight_grace));

        if let Some(reason) = &found {
            info!(reason = ?reason, "Task still settling, skipping this run");
        }
        Ok(found)
    }
}

fn classify(task: &Task, now: DateTime<Utc>, grace: Duration) -> Option<InFlight> {
    if task.last_status.is_transitional() {
        return Some(InFlight::TransitionalTask {
            task_arn: task.arn.clone(),
            status: task.last_status,
        });
    }

    let stopped_recently = task.stopped_at.is_some_and(|stopped_at| {
        // A stop time in the future counts as recent.
        (now - stopped_at).to_std().map_or(true, |elapsed| elapsed < grace)
    });
    stopped_recently.then(|| InFlight::RecentlyStopped {
        task_arn: task.arn.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_cloud::{MemoryCloud, Snapshot, Tags};

    fn config() -> Arc<ControllerConfig> {
        Arc::new(ControllerConfig {
            set_name: "db".to_string(),
            cluster: "cluster".to_string(),
            ..ControllerConfig::default()
        })
    }

    fn task(arn: &str, status: TaskStatus, tags: Tags) -> Task {
        Task {
            arn: arn.to_string(),
            last_status: status,
            tags,
            attachments: vec![],
            created_at: Some(Utc::now()),
            stopped_at: None,
        }
    }

    fn indexed(index: &str) -> Tags {
        Tags::from([("ess:db:index".to_string(), index.to_string())])
    }

    fn guard(cloud: &Arc<MemoryCloud>) -> ReadinessGuard {
        ReadinessGuard::new(cloud.clone(), cloud.clone(), config())
    }

    #[tokio::test]
    async fn test_settled_cloud_has_nothing_in_flight() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.insert_task("cluster", task("arn:1", TaskStatus::Running, indexed("0")));
        assert!(!guard(&cloud).has_in_flight().await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_snapshot_is_in_flight() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.insert_snapshot(Snapshot {
            id: "snap-1".to_string(),
            volume_id: Some("vol-1".to_string()),
            state: SnapshotState::Pending,
            start_time: Some(Utc::now()),
            description: None,
            tags: Tags::from([("ess:db:managed".to_string(), "true".to_string())]),
        });

        assert_eq!(
            guard(&cloud).in_flight().await.unwrap(),
            Some(InFlight::PendingSnapshot {
                snapshot_id: "snap-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_transitional_task_is_in_flight() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.insert_task("cluster", task("arn:1", TaskStatus::Provisioning, indexed("1")));
        assert!(matches!(
            guard(&cloud).in_flight().await.unwrap(),
            Some(InFlight::TransitionalTask { status: TaskStatus::Provisioning, .. })
        ));
    }

    #[tokio::test]
    async fn test_recent_stop_is_in_flight_until_grace_passes() {
        let cloud = Arc::new(MemoryCloud::new());
        let mut recent = task("arn:1", TaskStatus::Stopped, indexed("1"));
        recent.stopped_at = Some(Utc::now() - chrono::Duration::minutes(3));
        cloud.insert_task("cluster", recent);
        assert!(guard(&cloud).has_in_flight().await.unwrap());

        let cloud = Arc::new(MemoryCloud::new());
        let mut old = task("arn:1", TaskStatus::Stopped, indexed("1"));
        old.stopped_at = Some(Utc::now() - chrono::Duration::minutes(11));
        cloud.insert_task("cluster", old);
        assert!(!guard(&cloud).has_in_flight().await.unwrap());
    }

    #[tokio::test]
    async fn test_tasks_outside_the_set_are_ignored() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.insert_task("cluster", task("arn:1", TaskStatus::Pending, Tags::new()));
        cloud.insert_task("cluster", task("arn:2", TaskStatus::Stopping, indexed("x")));
        assert!(!guard(&cloud).has_in_flight().await.unwrap());
    }
}
