//! Volume and snapshot lifecycle.
//!
//! Replica volumes outlive their tasks. Once a volume is detached it is
//! snapshotted, and deleted only after a completed snapshot of it exists. A
//! replacement task for the same index is restored from the newest snapshot.
//! Old snapshots are pruned per index, but never while their source volume
//! still exists.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use ess_cloud::{
    CreateSnapshotRequest, Snapshot, SnapshotFilter, SnapshotState, StorageBackend, Volume,
    VolumeFilter, VolumeState,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::poll::poll_until;
use crate::tags::{ReplicaIndex, TagSchema};

/// What one storage pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageReport {
    /// Snapshots started for orphaned volumes.
    pub snapshots_created: Vec<String>,
    /// Orphaned volumes deleted after being captured.
    pub volumes_deleted: Vec<String>,
    /// Superseded snapshots deleted.
    pub snapshots_pruned: Vec<String>,
}

impl StorageReport {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots_created.is_empty()
            && self.volumes_deleted.is_empty()
            && self.snapshots_pruned.is_empty()
    }
}

/// Owns the volume to snapshot to volume lifecycle of each replica index.
pub struct StorageReconciler {
    storage: Arc<dyn StorageBackend>,
    config: Arc<ControllerConfig>,
    tags: TagSchema,
}

impl StorageReconciler {
    /// Create a reconciler for the configured replica set.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, config: Arc<ControllerConfig>) -> Self {
        let tags = TagSchema::new(&config.set_name);
        Self {
            storage,
            config,
            tags,
        }
    }

    /// Orphan reconciliation followed by duplicate pruning.
    ///
    /// # Errors
    /// Returns an error if orphan reconciliation fails or the snapshot
    /// listing for pruning fails.
    pub async fn reconcile(&self) -> Result<StorageReport> {
        let mut report = self.reconcile_orphans().await?;
        report.snapshots_pruned = self.prune_duplicate_snapshots().await?;
        Ok(report)
    }

    /// Snapshot or delete managed volumes that are no longer attached.
    ///
    /// Volumes younger than the configured minimum age are skipped, as are
    /// volumes without a well-formed index tag. A volume whose lineage already
    /// has a completed snapshot is deleted; one with a snapshot still pending
    /// is left for a later cycle; otherwise a snapshot is started and waited
    /// on until it is visible.
    ///
    /// # Errors
    /// Returns an error if a backend call fails or a new snapshot does not
    /// become visible in time.
    pub async fn reconcile_orphans(&self) -> Result<StorageReport> {
        let mut report = StorageReport::default();
        let orphans = self
            .storage
            .describe_volumes(
                &VolumeFilter::default()
                    .with_state(VolumeState::Available)
                    .with_tag(self.tags.managed_key(), "true"),
            )
            .await?;
        debug!(count = orphans.len(), "Detached managed volumes");

        let now = Utc::now();
        let min_age = self.config.timings.orphan_min_age;

        for volume in orphans {
            let Some(created) = volume.create_time else {
                debug!(volume_id = %volume.id, "Volume has no creation time, skipping");
                continue;
            };
            let old_enough = (now - created)
                .to_std()
                .is_ok_and(|age| age >= min_age);
            if !old_enough {
                debug!(volume_id = %volume.id, "Volume too young to snapshot, skipping");
                continue;
            }
            let Some(index) = self.tags.index_of(&volume.tags) else {
                warn!(volume_id = %volume.id, tags = ?volume.tags, "Volume has no replica index, skipping");
                continue;
            };

            let lineage = self
                .storage
                .describe_snapshots(
                    &SnapshotFilter::default()
                        .with_tag(self.tags.managed_key(), "true")
                        .with_tag(self.tags.volume_id_key(), volume.id.clone())
                        .with_state(SnapshotState::Completed)
                        .with_state(SnapshotState::Pending),
                )
                .await?;

            if lineage.iter().any(|s| s.state == SnapshotState::Completed) {
                info!(volume_id = %volume.id, index = %index, "Deleting orphaned volume with existing snapshot");
                let deleted = self.storage.delete_volume(&volume.id).await;
                match deleted {
                    Ok(()) => report.volumes_deleted.push(volume.id),
                    Err(e) if e.is_not_found() => {
                        debug!(volume_id = %volume.id, "Volume already gone");
                    }
                    Err(e) => return Err(e.into()),
                }
            } else if lineage.is_empty() {
                let snapshot_id = self.snapshot_volume(&volume, index).await?;
                report.snapshots_created.push(snapshot_id);
            } else {
                debug!(volume_id = %volume.id, "Snapshot of volume still pending");
            }
        }

        Ok(report)
    }

    /// Start a snapshot of `volume` and wait until lookups can see it.
    async fn snapshot_volume(&self, volume: &Volume, index: ReplicaIndex) -> Result<String> {
        info!(volume_id = %volume.id, index = %index, "Creating snapshot of orphaned volume");
        let snapshot_id = self
            .storage
            .create_snapshot(CreateSnapshotRequest {
                volume_id: volume.id.clone(),
                description: format!("{}: index {index}", self.config.set_name),
                tags: self.tags.snapshot_tags(index, &volume.id),
            })
            .await?;

        let timings = &self.config.timings;
        let storage = self.storage.as_ref();
        let id = snapshot_id.as_str();
        poll_until(
            "snapshot visibility",
            timings.snapshot_poll_interval,
            timings.snapshot_timeout,
            move || async move {
                match storage
                    .describe_snapshots(&SnapshotFilter::default().with_id(id))
                    .await
                {
                    Ok(found) => Ok((!found.is_empty()).then_some(())),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await?;

        info!(snapshot_id = %snapshot_id, volume_id = %volume.id, "Snapshot visible");
        Ok(snapshot_id)
    }

    /// Keep only the newest completed snapshot per index among snapshots
    /// whose source volume no longer exists.
    ///
    /// Individual delete failures are logged and skipped.
    ///
    /// # Errors
    /// Returns an error if listing snapshots or checking a source volume
    /// fails.
    pub async fn prune_duplicate_snapshots(&self) -> Result<Vec<String>> {
        let snapshots = self.completed_snapshots().await?;

        let mut source_exists: BTreeMap<String, bool> = BTreeMap::new();
        let mut groups: BTreeMap<ReplicaIndex, Vec<Snapshot>> = BTreeMap::new();

        for snapshot in snapshots {
            let Some(volume_id) = snapshot.volume_id.clone() else {
                continue;
            };
            let exists = match source_exists.get(&volume_id) {
                Some(&exists) => exists,
                None => {
                    let exists = self.volume_exists(&volume_id).await?;
                    source_exists.insert(volume_id, exists);
                    exists
                }
            };
            if exists {
                continue;
            }
            let Some(index) = self.tags.index_of(&snapshot.tags) else {
                continue;
            };
            groups.entry(index).or_default().push(snapshot);
        }

        let mut pruned = Vec::new();
        for (index, mut group) in groups {
            if group.len() <= 1 {
                continue;
            }
            group.sort_by(|a, b| b.start_time.cmp(&a.start_time));

            for snapshot in group.iter().skip(1) {
                match self.storage.delete_snapshot(&snapshot.id).await {
                    Ok(()) => {
                        info!(snapshot_id = %snapshot.id, index = %index, "Deleted superseded snapshot");
                        pruned.push(snapshot.id.clone());
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(snapshot_id = %snapshot.id, "Snapshot already gone");
                    }
                    Err(e) => {
                        warn!(snapshot_id = %snapshot.id, error = %e, "Failed to delete snapshot");
                    }
                }
            }
        }

        Ok(pruned)
    }

    /// Whether any available or in-use volume tagged for `index` lacks a
    /// completed snapshot of its own lineage.
    ///
    /// # Errors
    /// Returns an error if a backend lookup fails.
    pub async fn has_unsnapshotted_volume(&self, index: ReplicaIndex) -> Result<bool> {
        let volumes = self
            .storage
            .describe_volumes(
                &VolumeFilter::default()
                    .with_tag(self.tags.index_key(), index.to_string())
                    .with_state(VolumeState::Available)
                    .with_state(VolumeState::InUse),
            )
            .await?;

        for volume in volumes {
            let snapshots = self
                .storage
                .describe_snapshots(
                    &SnapshotFilter::default()
                        .with_tag(self.tags.volume_id_key(), volume.id.clone())
                        .with_state(SnapshotState::Completed),
                )
                .await?;
            if snapshots.is_empty() {
                info!(volume_id = %volume.id, index = %index, "Volume has no completed snapshot");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Newest completed snapshot tagged for `index`.
    ///
    /// # Errors
    /// Returns an error if the snapshot lookup fails.
    pub async fn latest_snapshot(&self, index: ReplicaIndex) -> Result<Option<String>> {
        let latest = self
            .storage
            .describe_snapshots(
                &SnapshotFilter::default()
                    .with_tag(self.tags.index_key(), index.to_string())
                    .with_tag(self.tags.managed_key(), "true")
                    .with_state(SnapshotState::Completed),
            )
            .await?
            .into_iter()
            .max_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)))
            .map(|s| s.id);

        if latest.is_none() {
            debug!(index = %index, "No snapshot found for index");
        }
        Ok(latest)
    }

    /// All managed volumes, in any state.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn managed_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self
            .storage
            .describe_volumes(&VolumeFilter::default().with_tag(self.tags.managed_key(), "true"))
            .await?)
    }

    /// All completed managed snapshots.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn completed_snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self
            .storage
            .describe_snapshots(
                &SnapshotFilter::default()
                    .with_tag(self.tags.managed_key(), "true")
                    .with_state(SnapshotState::Completed),
            )
            .await?)
    }

    async fn volume_exists(&self, volume_id: &str) -> Result<bool> {
        match self
            .storage
            .describe_volumes(&VolumeFilter::default().with_id(volume_id))
            .await
        {
            Ok(volumes) => Ok(volumes.iter().any(|v| v.state != VolumeState::Deleted)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::DateTime;
    use ess_cloud::memory::Operation;
    use ess_cloud::{MemoryCloud, Tags};

    use crate::config::Timings;

    fn config() -> Arc<ControllerConfig> {
        Arc::new(ControllerConfig {
            set_name: "db".to_string(),
            timings: Timings {
                snapshot_poll_interval: Duration::from_millis(5),
                snapshot_timeout: Duration::from_millis(50),
                ..Timings::default()
            },
            ..ControllerConfig::default()
        })
    }

    fn reconciler(cloud: &Arc<MemoryCloud>) -> StorageReconciler {
        StorageReconciler::new(cloud.clone(), config())
    }

    fn schema() -> TagSchema {
        TagSchema::new("db")
    }

    fn volume(id: &str, index: u32, state: VolumeState, age_minutes: i64) -> Volume {
        Volume {
            id: id.to_string(),
            state,
            create_time: Some(Utc::now() - chrono::Duration::minutes(age_minutes)),
            size_gib: Some(20),
            tags: schema().replica_tags(ReplicaIndex::new(index), None),
        }
    }

    fn snapshot(id: &str, volume_id: &str, index: u32, started: DateTime<Utc>) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            volume_id: Some(volume_id.to_string()),
            state: SnapshotState::Completed,
            start_time: Some(started),
            description: None,
            tags: schema().snapshot_tags(ReplicaIndex::new(index), volume_id),
        }
    }

    #[tokio::test]
    async fn test_orphan_without_snapshot_is_snapshotted() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.insert_volume(volume("vol-1", 1, VolumeState::Available, 5));

        let report = reconciler(&cloud).reconcile_orphans().await.unwrap();
        assert_eq!(report.snapshots_created.len(), 1);
        assert!(report.volumes_deleted.is_empty());

        let snapshots = cloud.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].volume_id.as_deref(), Some("vol-1"));
        assert_eq!(snapshots[0].description.as_deref(), Some("db: index 1"));
        assert_eq!(snapshots[0].tags, schema().snapshot_tags(ReplicaIndex::new(1), "vol-1"));
        assert_eq!(cloud.volumes().len(), 1);
    }

    #[tokio::test]
    async fn test_orphan_with_completed_snapshot_is_deleted() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.insert_volume(volume("vol-1", 1, VolumeState::Available, 5));
        cloud.insert_snapshot(snapshot("snap-1", "vol-1", 1, Utc::now()));

        let report = reconciler(&cloud).reconcile_orphans().await.unwrap();
        assert_eq!(report.volumes_deleted, vec!["vol-1"]);
        assert!(cloud.volumes().is_empty());
    }

    #[tokio::test]
    async fn test_young_and_attached_volumes_are_left_alone() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.insert_volume(volume("vol-young", 0, VolumeState::Available, 1));
        cloud.insert_volume(volume("vol-attached", 1, VolumeState::InUse, 30));
        let mut untagged = volume("vol-untagged", 2, VolumeState::Available, 30);
        untagged.tags.remove("ess:db:index");
        cloud.insert_volume(untagged);

        let report = reconciler(&cloud).reconcile_orphans().await.unwrap();
        assert!(report.is_empty());
        assert!(cloud.operations().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_with_pending_snapshot_waits() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.insert_volume(volume("vol-1", 1, VolumeState::Available, 5));
        let mut pending = snapshot("snap-1", "vol-1", 1, Utc::now());
        pending.state = SnapshotState::Pending;
        cloud.insert_snapshot(pending);

        let report = reconciler(&cloud).reconcile_orphans().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(cloud.volumes().len(), 1);
    }

    #[tokio::test]
    async fn test_invisible_snapshot_times_out() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.configure(|b| b.snapshots_visible = false);
        cloud.insert_volume(volume("vol-1", 1, VolumeState::Available, 5));

        let err = reconciler(&cloud).reconcile_orphans().await.unwrap_err();
        assert!(matches!(err, crate::ControllerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_when_source_gone() {
        let cloud = Arc::new(MemoryCloud::new());
        let now = Utc::now();
        cloud.insert_snapshot(snapshot("snap-old", "vol-a", 0, now - chrono::Duration::hours(2)));
        cloud.insert_snapshot(snapshot("snap-mid", "vol-b", 0, now - chrono::Duration::hours(1)));
        cloud.insert_snapshot(snapshot("snap-new", "vol-c", 0, now));
        cloud.insert_snapshot(snapshot("snap-other", "vol-d", 1, now));

        let pruned = reconciler(&cloud).prune_duplicate_snapshots().await.unwrap();
        assert_eq!(pruned.len(), 2);

        let remaining: Vec<String> = cloud.snapshots().into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec!["snap-new", "snap-other"]);
    }

    #[tokio::test]
    async fn test_prune_spares_snapshots_of_existing_volumes() {
        let cloud = Arc::new(MemoryCloud::new());
        let now = Utc::now();
        cloud.insert_volume(volume("vol-a", 0, VolumeState::Available, 30));
        cloud.insert_snapshot(snapshot("snap-a", "vol-a", 0, now - chrono::Duration::hours(1)));
        cloud.insert_snapshot(snapshot("snap-b", "vol-b", 0, now));

        let pruned = reconciler(&cloud).prune_duplicate_snapshots().await.unwrap();
        assert!(pruned.is_empty());
        assert_eq!(cloud.snapshots().len(), 2);
        assert!(!cloud
            .operations()
            .iter()
            .any(|op| matches!(op, Operation::DeleteSnapshot { .. })));
    }

    #[tokio::test]
    async fn test_unsnapshotted_volume_gate() {
        let cloud = Arc::new(MemoryCloud::new());
        let storage = reconciler(&cloud);
        cloud.insert_volume(volume("vol-1", 1, VolumeState::InUse, 30));
        assert!(storage.has_unsnapshotted_volume(ReplicaIndex::new(1)).await.unwrap());
        assert!(!storage.has_unsnapshotted_volume(ReplicaIndex::new(0)).await.unwrap());

        cloud.insert_snapshot(snapshot("snap-1", "vol-1", 1, Utc::now()));
        assert!(!storage.has_unsnapshotted_volume(ReplicaIndex::new(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_snapshot_picks_newest_for_index() {
        let cloud = Arc::new(MemoryCloud::new());
        let now = Utc::now();
        cloud.insert_snapshot(snapshot("snap-1", "vol-a", 2, now - chrono::Duration::hours(1)));
        cloud.insert_snapshot(snapshot("snap-2", "vol-b", 2, now));
        cloud.insert_snapshot(snapshot("snap-3", "vol-c", 3, now + chrono::Duration::hours(1)));
        let mut foreign = snapshot("snap-4", "vol-d", 2, now + chrono::Duration::hours(2));
        foreign.tags = Tags::from([("ess:db:index".to_string(), "2".to_string())]);
        cloud.insert_snapshot(foreign);

        let storage = reconciler(&cloud);
        assert_eq!(
            storage.latest_snapshot(ReplicaIndex::new(2)).await.unwrap().as_deref(),
            Some("snap-2")
        );
        assert_eq!(storage.latest_snapshot(ReplicaIndex::new(7)).await.unwrap(), None);
    }
}
