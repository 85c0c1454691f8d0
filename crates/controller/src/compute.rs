//! Replica task lifecycle.

use std::sync::Arc;

use ess_cloud::{
    ComputeBackend, DesiredStatus, ManagedVolume, RunTaskRequest, Task, TaskStatus,
};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::poll::poll_until;
use crate::tags::{ReplicaIndex, TagSchema};

/// Reason recorded on tasks stopped by a scale-down.
pub const STOP_REASON: &str = "Scaling down replicas to match StatefulSet configuration";

/// Name of the managed volume in the task definition.
pub const VOLUME_NAME: &str = "volume";

/// A task belonging to the replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveReplica {
    /// Replica index from the task's tags.
    pub index: ReplicaIndex,
    /// The task as last described.
    pub task: Task,
}

impl ActiveReplica {
    /// Pair a described task with its index.
    #[must_use]
    pub fn new(index: ReplicaIndex, task: Task) -> Self {
        Self { index, task }
    }

    /// Task ARN.
    #[must_use]
    pub fn task_arn(&self) -> &str {
        &self.task.arn
    }

    /// Last reported task status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.task.last_status
    }

    /// Private address, once assigned.
    #[must_use]
    pub fn private_ip(&self) -> Option<&str> {
        self.task.private_ip()
    }
}

/// Starts, stops and inspects replica tasks.
pub struct ComputeManager {
    compute: Arc<dyn ComputeBackend>,
    config: Arc<ControllerConfig>,
    tags: TagSchema,
}

impl ComputeManager {
    /// Create a manager for the configured replica set.
    #[must_use]
    pub fn new(compute: Arc<dyn ComputeBackend>, config: Arc<ControllerConfig>) -> Self {
        let tags = TagSchema::new(&config.set_name);
        Self {
            compute,
            config,
            tags,
        }
    }

    /// Tasks of this set the platform intends to keep running, by index.
    ///
    /// Tasks without a well-formed index tag are not part of the set.
    ///
    /// # Errors
    /// Returns an error if listing or describing tasks fails.
    pub async fn list_active(&self) -> Result<Vec<ActiveReplica>> {
        let cluster = &self.config.cluster;
        let arns = self.compute.list_tasks(cluster, DesiredStatus::Running).await?;
        if arns.is_empty() {
            return Ok(Vec::new());
        }

        let mut active: Vec<ActiveReplica> = self
            .compute
            .describe_tasks(cluster, &arns)
            .await?
            .into_iter()
            .filter_map(|task| {
                let index = self.tags.index_of(&task.tags);
                if index.is_none() {
                    debug!(task_arn = %task.arn, "Task has no replica index, ignoring");
                }
                Some(ActiveReplica::new(index?, task))
            })
            .collect();
        active.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.task.arn.cmp(&b.task.arn)));
        Ok(active)
    }

    /// Build the launch request for `index`.
    #[must_use]
    pub fn run_request(&self, index: ReplicaIndex, restore_from: Option<&str>) -> RunTaskRequest {
        let config = &self.config;
        let tags = self.tags.replica_tags(index, restore_from);

        RunTaskRequest {
            cluster: config.cluster.clone(),
            task_definition: config.task_definition_arn.clone(),
            container_name: config.container_name.clone(),
            subnets: config.subnet_ids.clone(),
            security_groups: vec![config.security_group_id.clone()],
            environment: config.environment_for(index),
            enable_execute_command: config.enable_execute_command,
            volume: Some(ManagedVolume {
                name: VOLUME_NAME.to_string(),
                size_gib: config.volume_size_gib,
                snapshot_id: restore_from.map(str::to_string),
                role_arn: config.volume_role_arn.clone(),
                tags: tags.clone(),
            }),
            tags,
        }
    }

    /// Launch one task for `index`, optionally restoring its volume from a
    /// snapshot, and wait until the platform can describe it.
    ///
    /// # Errors
    /// Returns an error if the launch fails or the task does not become
    /// visible within the configured bound.
    pub async fn start(&self, index: ReplicaIndex, restore_from: Option<&str>) -> Result<Task> {
        info!(
            index = %index,
            snapshot_id = restore_from.unwrap_or("none"),
            "Starting replica task"
        );

        let task_arn = self
            .compute
            .run_task(self.run_request(index, restore_from))
            .await?;

        let timings = &self.config.timings;
        let cluster = self.config.cluster.as_str();
        let compute = self.compute.as_ref();
        let arn = task_arn.as_str();
        let task = poll_until(
            "task visibility",
            timings.task_poll_interval,
            timings.task_timeout,
            move || async move { describe_one(compute, cluster, arn).await },
        )
        .await?;

        info!(index = %index, task_arn = %task.arn, status = %task.last_status, "Replica task visible");
        Ok(task)
    }

    /// Wait until the task's network attachment exposes a private address.
    ///
    /// # Errors
    /// Returns [`ControllerError::LaunchFailed`] if the task stops first and
    /// [`ControllerError::Timeout`] if no address appears within the bound.
    pub async fn await_network_address(&self, task_arn: &str) -> Result<Task> {
        let timings = &self.config.timings;
        let cluster = self.config.cluster.as_str();
        let compute = self.compute.as_ref();

        let task = poll_until(
            "network address",
            timings.address_poll_interval,
            timings.address_timeout,
            move || async move {
                let Some(task) = describe_one(compute, cluster, task_arn).await? else {
                    return Ok(None);
                };
                if task.private_ip().is_some() {
                    return Ok(Some(task));
                }
                if matches!(task.last_status, TaskStatus::Stopped | TaskStatus::Deleted) {
                    return Err(ControllerError::LaunchFailed(format!(
                        "task {task_arn} stopped before receiving an address"
                    )));
                }
                Ok(None)
            },
        )
        .await?;

        info!(task_arn, ip = task.private_ip().unwrap_or_default(), "Replica address assigned");
        Ok(task)
    }

    /// Request that a task stop. Does not wait for it to reach `STOPPED`.
    ///
    /// # Errors
    /// Returns an error if describing or stopping the task fails.
    pub async fn stop(&self, task_arn: &str) -> Result<()> {
        let cluster = &self.config.cluster;
        let Some(task) = describe_one(self.compute.as_ref(), cluster, task_arn).await? else {
            warn!(task_arn, "Task not found, nothing to stop");
            return Ok(());
        };

        info!(task_arn, status = %task.last_status, "Stopping replica task");
        self.compute.stop_task(cluster, task_arn, STOP_REASON).await?;
        Ok(())
    }
}

async fn describe_one(
    compute: &dyn ComputeBackend,
    cluster: &str,
    task_arn: &str,
) -> Result<Option<Task>> {
    let tasks = compute
        .describe_tasks(cluster, &[task_arn.to_string()])
        .await?;
    Ok(tasks.into_iter().find(|t| t.arn == task_arn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ess_cloud::memory::Operation;
    use ess_cloud::{MemoryCloud, Tags};

    use crate::config::Timings;

    fn config() -> Arc<ControllerConfig> {
        Arc::new(ControllerConfig {
            set_name: "db".to_string(),
            cluster: "cluster".to_string(),
            task_definition_arn: "arn:td".to_string(),
            container_name: "app".to_string(),
            subnet_ids: vec!["subnet-1".to_string(), "subnet-2".to_string()],
            security_group_id: "sg-1".to_string(),
            volume_role_arn: "arn:role".to_string(),
            environment: [("NODE".to_string(), "db-$index".to_string())].into(),
            timings: Timings {
                task_poll_interval: Duration::from_millis(5),
                task_timeout: Duration::from_millis(50),
                address_poll_interval: Duration::from_millis(5),
                address_timeout: Duration::from_millis(50),
                ..Timings::default()
            },
            ..ControllerConfig::default()
        })
    }

    fn manager(cloud: &Arc<MemoryCloud>) -> ComputeManager {
        ComputeManager::new(cloud.clone(), config())
    }

    #[test]
    fn test_run_request_shape() {
        let cloud = Arc::new(MemoryCloud::new());
        let req = manager(&cloud).run_request(ReplicaIndex::new(2), Some("snap-7"));

        assert_eq!(req.security_groups, vec!["sg-1"]);
        assert_eq!(req.environment[0].value, "db-2");
        assert_eq!(req.tags.get("ess:db:index").map(String::as_str), Some("2"));
        assert_eq!(req.tags.get("ess:db:snapshot-id").map(String::as_str), Some("snap-7"));

        let volume = req.volume.unwrap();
        assert_eq!(volume.name, "volume");
        assert_eq!(volume.size_gib, 20);
        assert_eq!(volume.snapshot_id.as_deref(), Some("snap-7"));
        assert_eq!(volume.tags, req.tags);
    }

    #[tokio::test]
    async fn test_list_active_filters_and_sorts() {
        let cloud = Arc::new(MemoryCloud::new());
        let compute = manager(&cloud);
        compute.start(ReplicaIndex::new(2), None).await.unwrap();
        compute.start(ReplicaIndex::new(0), None).await.unwrap();
        cloud.insert_task(
            "cluster",
            Task {
                arn: "arn:foreign".to_string(),
                last_status: TaskStatus::Running,
                tags: Tags::from([("ess:db:index".to_string(), "-1".to_string())]),
                attachments: vec![],
                created_at: None,
                stopped_at: None,
            },
        );

        let active = compute.list_active().await.unwrap();
        let indices: Vec<u32> = active.iter().map(|r| r.index.get()).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_start_times_out_when_task_never_visible() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.configure(|b| b.tasks_visible = false);

        let err = manager(&cloud)
            .start(ReplicaIndex::new(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_await_address_times_out_without_address() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.configure(|b| b.assign_addresses = false);
        let compute = manager(&cloud);
        let task = compute.start(ReplicaIndex::new(0), None).await.unwrap();

        let err = compute.await_network_address(&task.arn).await.unwrap_err();
        assert!(matches!(err, ControllerError::Timeout { ref operation, .. } if operation == "network address"));
    }

    #[tokio::test]
    async fn test_await_address_fails_when_task_stops() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.configure(|b| b.assign_addresses = false);
        let compute = manager(&cloud);
        let task = compute.start(ReplicaIndex::new(0), None).await.unwrap();
        cloud.set_task_status(&task.arn, TaskStatus::Stopped);

        let err = compute.await_network_address(&task.arn).await.unwrap_err();
        assert!(matches!(err, ControllerError::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_stop_unknown_task_is_noop() {
        let cloud = Arc::new(MemoryCloud::new());
        manager(&cloud).stop("arn:missing").await.unwrap();
        assert!(cloud.operations().is_empty());
    }

    #[tokio::test]
    async fn test_stop_requests_stop() {
        let cloud = Arc::new(MemoryCloud::new());
        let compute = manager(&cloud);
        let task = compute.start(ReplicaIndex::new(1), None).await.unwrap();
        compute.stop(&task.arn).await.unwrap();

        assert!(cloud.operations().contains(&Operation::StopTask {
            task_arn: task.arn.clone()
        }));
        assert!(compute.list_active().await.unwrap().is_empty());
    }
}
