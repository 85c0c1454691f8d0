//! The control cycle.
//!
//! One invocation runs the guard, takes the lock, reconciles storage, scales
//! the replica set by at most one task, syncs DNS and targets, reconciles
//! storage again and releases the lock. Steps run strictly in order.

use std::collections::BTreeSet;
use std::sync::Arc;

use ess_cloud::{
    ComputeBackend, DnsBackend, LoadBalancerBackend, LockBackend, Snapshot, StorageBackend,
    TaskStatus, Volume,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::compute::{ActiveReplica, ComputeManager};
use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::guard::{InFlight, ReadinessGuard};
use crate::lock::{LockManager, LOCK_ID};
use crate::network::{NetworkReconciler, NetworkReport};
use crate::storage::{StorageReconciler, StorageReport};
use crate::tags::ReplicaIndex;

/// Backend handles the controller works against.
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputeBackend>,
    pub storage: Arc<dyn StorageBackend>,
    pub dns: Arc<dyn DnsBackend>,
    pub load_balancer: Arc<dyn LoadBalancerBackend>,
    pub lock: Arc<dyn LockBackend>,
}

impl Backends {
    /// Use one provider for every backend.
    #[must_use]
    pub fn from_cloud<C>(cloud: Arc<C>) -> Self
    where
        C: ComputeBackend + StorageBackend + DnsBackend + LoadBalancerBackend + LockBackend + 'static,
    {
        Self {
            compute: cloud.clone(),
            storage: cloud.clone(),
            dns: cloud.clone(),
            load_balancer: cloud.clone(),
            lock: cloud,
        }
    }
}

/// The single scaling decision of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReplicaAction {
    /// A task was started for `index`.
    Started {
        index: ReplicaIndex,
        task_arn: String,
        snapshot_id: Option<String>,
    },
    /// The highest-index task was stopped.
    Stopped { index: ReplicaIndex, task_arn: String },
    /// `index` still has a volume without a snapshot; no task was started.
    Deferred { index: ReplicaIndex },
    /// Below the desired count, but every index is taken by a task that is
    /// not running yet.
    NoIndexAvailable,
    /// Already at the desired count.
    Steady,
}

/// What a completed cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub action: ReplicaAction,
    /// Running tasks observed before scaling.
    pub running: usize,
    /// Active tasks observed before scaling.
    pub active: usize,
    pub desired: u32,
    pub storage_pre: StorageReport,
    pub network: NetworkReport,
    pub storage_post: StorageReport,
}

/// How a cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The guard found work still in flight; no lock was taken.
    Skipped(InFlight),
    /// Another holder owns the lock.
    Contended,
    /// Every step ran.
    Completed(CycleReport),
    /// A step failed after the lock was taken. The lock was released.
    Failed { error: ControllerError },
}

/// One replica as shown by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub index: ReplicaIndex,
    pub status: TaskStatus,
    pub private_ip: Option<String>,
    pub task_arn: String,
}

/// Read-only view of the replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetStatus {
    pub desired: u32,
    pub replicas: Vec<ReplicaStatus>,
    pub volumes: Vec<Volume>,
    pub snapshots: Vec<Snapshot>,
}

/// Drives control cycles for one replica set.
pub struct Controller {
    config: Arc<ControllerConfig>,
    lock: LockManager,
    guard: ReadinessGuard,
    storage: StorageReconciler,
    compute: ComputeManager,
    network: NetworkReconciler,
}

impl Controller {
    /// Validate `config` and wire the components.
    ///
    /// # Errors
    /// Returns [`ControllerError::Config`] if the configuration is invalid.
    pub fn new(config: ControllerConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let lock = LockManager::new(
            backends.lock,
            config.lock_table.clone(),
            config.timings.lock_ttl,
        )
        .with_expired_reclaim(config.reclaim_expired_lock);

        Ok(Self {
            guard: ReadinessGuard::new(
                backends.compute.clone(),
                backends.storage.clone(),
                config.clone(),
            ),
            storage: StorageReconciler::new(backends.storage, config.clone()),
            compute: ComputeManager::new(backends.compute, config.clone()),
            network: NetworkReconciler::new(backends.dns, backends.load_balancer, config.clone()),
            lock,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run one control cycle.
    ///
    /// Failures after the lock is taken are logged and reported as
    /// [`CycleOutcome::Failed`]; the lock is released on every path that
    /// acquired it.
    ///
    /// # Errors
    /// Returns an error if the guard check or lock acquisition fails, or if
    /// the lock cannot be released.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let set = self.config.set_name.as_str();

        if let Some(reason) = self.guard.in_flight().await? {
            info!(set, reason = ?reason, "Operation in flight, skipping cycle");
            return Ok(CycleOutcome::Skipped(reason));
        }

        if !self.lock.acquire(LOCK_ID).await? {
            info!(set, "Controller lock held elsewhere, skipping cycle");
            return Ok(CycleOutcome::Contended);
        }

        let result = self.reconcile().await;
        let released = self.lock.release(LOCK_ID).await;

        match (result, released) {
            (Ok(report), Ok(())) => {
                info!(
                    set,
                    action = ?report.action,
                    running = report.running,
                    active = report.active,
                    desired = report.desired,
                    "Cycle complete"
                );
                Ok(CycleOutcome::Completed(report))
            }
            (Err(error), Ok(())) => {
                error!(set, error = %error, "Cycle failed");
                Ok(CycleOutcome::Failed { error })
            }
            (Ok(_), Err(release_error)) => Err(release_error),
            (Err(error), Err(release_error)) => {
                error!(set, error = %error, "Cycle failed");
                Err(release_error)
            }
        }
    }

    /// Steps run under the lock.
    async fn reconcile(&self) -> Result<CycleReport> {
        let storage_pre = self.storage.reconcile().await?;

        let active = self.compute.list_active().await?;
        let running = active
            .iter()
            .filter(|r| r.status() == TaskStatus::Running)
            .count();
        info!(
            running,
            active = active.len(),
            desired = self.config.desired_replicas,
            "Observed replica set"
        );

        let action = self.reconcile_replicas(&active, running).await?;

        let live = self.compute.list_active().await?;
        let mut network = self.network.sync_live(&live).await?;
        network.targets_deregistered = self
            .network
            .prune_drift(&live)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        let storage_post = self.storage.reconcile().await?;

        Ok(CycleReport {
            action,
            running,
            active: active.len(),
            desired: self.config.desired_replicas,
            storage_pre,
            network,
            storage_post,
        })
    }

    /// Start or stop at most one task.
    async fn reconcile_replicas(
        &self,
        active: &[ActiveReplica],
        running: usize,
    ) -> Result<ReplicaAction> {
        let desired = self.config.desired_replicas;
        let desired_count = usize::try_from(desired).unwrap_or(usize::MAX);

        if running < desired_count {
            let used: BTreeSet<ReplicaIndex> = active.iter().map(|r| r.index).collect();
            let Some(index) = (0..desired)
                .map(ReplicaIndex::new)
                .find(|i| !used.contains(i))
            else {
                info!(running, desired, "Every index is taken by a starting task");
                return Ok(ReplicaAction::NoIndexAvailable);
            };

            if self.storage.has_unsnapshotted_volume(index).await? {
                warn!(index = %index, "Volume for index not yet snapshotted, deferring start");
                return Ok(ReplicaAction::Deferred { index });
            }

            let snapshot_id = self.storage.latest_snapshot(index).await?;
            let task = self.compute.start(index, snapshot_id.as_deref()).await?;
            let task = self.compute.await_network_address(&task.arn).await?;
            let replica = ActiveReplica::new(index, task);
            self.network.upsert_record(&replica).await?;

            info!(index = %index, task_arn = %replica.task_arn(), "Replica started");
            return Ok(ReplicaAction::Started {
                index,
                task_arn: replica.task.arn,
                snapshot_id,
            });
        }

        if active.len() > desired_count {
            let Some(victim) = active.iter().max_by_key(|r| r.index) else {
                return Ok(ReplicaAction::Steady);
            };
            info!(index = %victim.index, task_arn = %victim.task_arn(), "Scaling down replica");

            self.network.deregister_target(victim).await?;
            self.network.delete_record(victim).await;
            self.compute.stop(victim.task_arn()).await?;

            return Ok(ReplicaAction::Stopped {
                index: victim.index,
                task_arn: victim.task.arn.clone(),
            });
        }

        Ok(ReplicaAction::Steady)
    }

    /// Current replicas, volumes and snapshots. Takes no lock.
    ///
    /// # Errors
    /// Returns an error if a backend lookup fails.
    pub async fn status(&self) -> Result<SetStatus> {
        let replicas = self
            .compute
            .list_active()
            .await?
            .into_iter()
            .map(|r| ReplicaStatus {
                index: r.index,
                status: r.status(),
                private_ip: r.private_ip().map(str::to_string),
                task_arn: r.task.arn,
            })
            .collect();

        Ok(SetStatus {
            desired: self.config.desired_replicas,
            replicas,
            volumes: self.storage.managed_volumes().await?,
            snapshots: self.storage.completed_snapshots().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_cloud::MemoryCloud;

    fn config(desired: u32) -> ControllerConfig {
        ControllerConfig {
            set_name: "db".to_string(),
            cluster: "cluster".to_string(),
            task_definition_arn: "arn:td".to_string(),
            container_name: "app".to_string(),
            desired_replicas: desired,
            lock_table: "locks".to_string(),
            subnet_ids: vec!["subnet-1".to_string()],
            security_group_id: "sg-1".to_string(),
            hosted_zone_id: "Z1".to_string(),
            dns_domain: "internal".to_string(),
            target_group_arn: "arn:tg".to_string(),
            volume_role_arn: "arn:role".to_string(),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let cloud = Arc::new(MemoryCloud::new());
        let mut bad = config(1);
        bad.cluster.clear();
        assert!(matches!(
            Controller::new(bad, Backends::from_cloud(cloud)),
            Err(ControllerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_status_lists_replicas() {
        let cloud = Arc::new(MemoryCloud::new());
        let controller = Controller::new(config(1), Backends::from_cloud(cloud)).unwrap();
        let outcome = controller.run_cycle().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Completed(CycleReport {
                action: ReplicaAction::Started { .. },
                ..
            })
        ));

        let status = controller.status().await.unwrap();
        assert_eq!(status.desired, 1);
        assert_eq!(status.replicas.len(), 1);
        assert_eq!(status.replicas[0].index, ReplicaIndex::new(0));
        assert!(status.replicas[0].private_ip.is_some());
        assert_eq!(status.volumes.len(), 1);
    }

    #[test]
    fn test_replica_action_serializes_tagged() {
        let action = ReplicaAction::Deferred {
            index: ReplicaIndex::new(2),
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            serde_json::json!({"action": "deferred", "index": 2})
        );
    }
}
