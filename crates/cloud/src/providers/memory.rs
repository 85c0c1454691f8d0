//! In-memory backend for tests and local dry runs.
//!
//! [`MemoryCloud`] implements every backend trait over one shared state and
//! records each mutating call in an operation journal, so callers can assert
//! on ordering across services. Error behavior follows the real services
//! where the controller depends on it: describing or deleting an unknown
//! volume or snapshot fails with a `*.NotFound` code, deleting an absent DNS
//! record fails with `InvalidChangeBatch`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::traits::{
    Attachment, CloudProviderError, ComputeBackend, CreateSnapshotRequest, DesiredStatus,
    DnsBackend, LoadBalancerBackend, LockBackend, LockRecord, PutCondition, PutOutcome,
    RecordSet, RunTaskRequest, Snapshot, SnapshotFilter, SnapshotState, StorageBackend, Target,
    TargetHealth, Task, TaskStatus, Volume, VolumeFilter, VolumeState,
};

/// A mutating call observed by [`MemoryCloud`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    RunTask {
        task_arn: String,
        snapshot_id: Option<String>,
    },
    StopTask {
        task_arn: String,
    },
    CreateSnapshot {
        snapshot_id: String,
        volume_id: String,
    },
    DeleteVolume {
        volume_id: String,
    },
    DeleteSnapshot {
        snapshot_id: String,
    },
    UpsertRecord {
        name: String,
        values: Vec<String>,
    },
    DeleteRecord {
        name: String,
    },
    RegisterTargets {
        ids: Vec<String>,
    },
    DeregisterTargets {
        ids: Vec<String>,
    },
    PutLock {
        lock_id: String,
    },
    DeleteLock {
        lock_id: String,
    },
}

/// Knobs controlling how [`MemoryCloud`] reacts to launches and snapshots.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Status of a task right after `run_task`.
    pub launch_status: TaskStatus,
    /// Whether launched tasks get a private address immediately.
    pub assign_addresses: bool,
    /// Whether launched tasks are visible to `describe_tasks`.
    pub tasks_visible: bool,
    /// Status of a task right after `stop_task`.
    pub stop_status: TaskStatus,
    /// State of a snapshot right after `create_snapshot`.
    pub snapshot_state: SnapshotState,
    /// Whether new snapshots are visible to `describe_snapshots`.
    pub snapshots_visible: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            launch_status: TaskStatus::Running,
            assign_addresses: true,
            tasks_visible: true,
            stop_status: TaskStatus::Stopped,
            snapshot_state: SnapshotState::Completed,
            snapshots_visible: true,
        }
    }
}

#[derive(Debug, Default)]
struct CloudState {
    tasks: BTreeMap<String, (String, Task)>,
    volumes: BTreeMap<String, Volume>,
    snapshots: BTreeMap<String, Snapshot>,
    records: BTreeMap<(String, String), RecordSet>,
    targets: BTreeMap<String, Vec<Target>>,
    locks: BTreeMap<(String, String), i64>,
    operations: Vec<Operation>,
    next_id: u64,
    behavior: Behavior,
}

impl CloudState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of all backend traits.
#[derive(Debug, Default)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
}

fn not_found(code: &str, id: &str) -> CloudProviderError {
    CloudProviderError::Api {
        status: 400,
        code: code.to_string(),
        message: format!("The resource '{id}' does not exist"),
    }
}

impl MemoryCloud {
    /// Creates an empty cloud with default behavior.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adjust launch and snapshot behavior.
    pub fn configure(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.state().behavior);
    }

    /// Seed a task in `cluster`.
    pub fn insert_task(&self, cluster: &str, task: Task) {
        self.state()
            .tasks
            .insert(task.arn.clone(), (cluster.to_string(), task));
    }

    /// Seed a volume.
    pub fn insert_volume(&self, volume: Volume) {
        self.state().volumes.insert(volume.id.clone(), volume);
    }

    /// Seed a snapshot.
    pub fn insert_snapshot(&self, snapshot: Snapshot) {
        self.state().snapshots.insert(snapshot.id.clone(), snapshot);
    }

    /// Move a known task to `status`.
    pub fn set_task_status(&self, task_arn: &str, status: TaskStatus) {
        if let Some((_, task)) = self.state().tasks.get_mut(task_arn) {
            task.last_status = status;
        }
    }

    /// Move a known snapshot to `state`.
    pub fn set_snapshot_state(&self, snapshot_id: &str, state: SnapshotState) {
        if let Some(snapshot) = self.state().snapshots.get_mut(snapshot_id) {
            snapshot.state = state;
        }
    }

    /// All tasks, in ARN order.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.state().tasks.values().map(|(_, t)| t.clone()).collect()
    }

    /// All volumes, in id order.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        self.state().volumes.values().cloned().collect()
    }

    /// All snapshots, in id order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.state().snapshots.values().cloned().collect()
    }

    /// Records in `zone_id`, in name order.
    #[must_use]
    pub fn records(&self, zone_id: &str) -> Vec<RecordSet> {
        self.state()
            .records
            .iter()
            .filter(|((zone, _), _)| zone == zone_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Targets registered with `target_group_arn`.
    #[must_use]
    pub fn targets(&self, target_group_arn: &str) -> Vec<Target> {
        self.state()
            .targets
            .get(target_group_arn)
            .cloned()
            .unwrap_or_default()
    }

    /// Expiry of a held lock, if any.
    #[must_use]
    pub fn lock_expiry(&self, table: &str, lock_id: &str) -> Option<i64> {
        self.state()
            .locks
            .get(&(table.to_string(), lock_id.to_string()))
            .copied()
    }

    /// The operation journal so far.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    /// Drain the operation journal.
    pub fn take_operations(&self) -> Vec<Operation> {
        std::mem::take(&mut self.state().operations)
    }
}

const fn is_desired_running(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Provisioning | TaskStatus::Pending | TaskStatus::Activating | TaskStatus::Running
    )
}

#[async_trait]
impl ComputeBackend for MemoryCloud {
    async fn list_tasks(
        &self,
        cluster: &str,
        desired_status: DesiredStatus,
    ) -> Result<Vec<String>, CloudProviderError> {
        let state = self.state();
        Ok(state
            .tasks
            .values()
            .filter(|(c, _)| c == cluster)
            .filter(|(_, t)| {
                is_desired_running(t.last_status) == (desired_status == DesiredStatus::Running)
            })
            .map(|(_, t)| t.arn.clone())
            .collect())
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> Result<Vec<Task>, CloudProviderError> {
        let state = self.state();
        Ok(task_arns
            .iter()
            .filter_map(|arn| state.tasks.get(arn))
            .filter(|(c, _)| c == cluster)
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn run_task(&self, req: RunTaskRequest) -> Result<String, CloudProviderError> {
        let mut state = self.state();
        let n = state.next_id();
        let now = Utc::now();
        let task_arn = format!("arn:aws:ecs:memory:000000000000:task/{}/{n:08}", req.cluster);

        let mut attachments = Vec::new();
        let mut snapshot_id = None;
        if let Some(volume) = req.volume {
            let volume_id = format!("vol-{n:08}");
            snapshot_id.clone_from(&volume.snapshot_id);
            state.volumes.insert(
                volume_id.clone(),
                Volume {
                    id: volume_id.clone(),
                    state: VolumeState::InUse,
                    create_time: Some(now),
                    size_gib: Some(volume.size_gib),
                    tags: volume.tags,
                },
            );
            attachments.push(Attachment::block_storage(volume_id));
        }
        if state.behavior.assign_addresses {
            attachments.push(Attachment::network_interface(format!(
                "10.0.{}.{}",
                n / 250,
                n % 250 + 1
            )));
        }

        let task = Task {
            arn: task_arn.clone(),
            last_status: state.behavior.launch_status,
            tags: req.tags,
            attachments,
            created_at: Some(now),
            stopped_at: None,
        };
        if state.behavior.tasks_visible {
            state.tasks.insert(task_arn.clone(), (req.cluster, task));
        }
        state.operations.push(Operation::RunTask {
            task_arn: task_arn.clone(),
            snapshot_id,
        });
        Ok(task_arn)
    }

    async fn stop_task(
        &self,
        cluster: &str,
        task_arn: &str,
        _reason: &str,
    ) -> Result<(), CloudProviderError> {
        let mut state = self.state();
        let stop_status = state.behavior.stop_status;
        let volume_id = match state.tasks.get_mut(task_arn) {
            Some((c, task)) if c.as_str() == cluster => {
                task.last_status = stop_status;
                task.stopped_at = Some(Utc::now());
                task.volume_id().map(str::to_string)
            }
            _ => return Err(CloudProviderError::NotFound(task_arn.to_string())),
        };
        if let Some(volume) = volume_id.and_then(|id| state.volumes.get_mut(&id)) {
            volume.state = VolumeState::Available;
        }
        state.operations.push(Operation::StopTask {
            task_arn: task_arn.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryCloud {
    async fn describe_volumes(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<Volume>, CloudProviderError> {
        let state = self.state();
        if let Some(missing) = filter.ids.iter().find(|id| !state.volumes.contains_key(*id)) {
            return Err(not_found("InvalidVolume.NotFound", missing));
        }
        Ok(state
            .volumes
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect())
    }

    async fn describe_snapshots(
        &self,
        filter: &SnapshotFilter,
    ) -> Result<Vec<Snapshot>, CloudProviderError> {
        let state = self.state();
        if let Some(missing) = filter
            .ids
            .iter()
            .find(|id| !state.snapshots.contains_key(*id))
        {
            return Err(not_found("InvalidSnapshot.NotFound", missing));
        }
        Ok(state
            .snapshots
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<String, CloudProviderError> {
        let mut state = self.state();
        if !state.volumes.contains_key(&req.volume_id) {
            return Err(not_found("InvalidVolume.NotFound", &req.volume_id));
        }
        let n = state.next_id();
        let snapshot_id = format!("snap-{n:08}");
        if state.behavior.snapshots_visible {
            let snapshot = Snapshot {
                id: snapshot_id.clone(),
                volume_id: Some(req.volume_id.clone()),
                state: state.behavior.snapshot_state,
                start_time: Some(Utc::now()),
                description: Some(req.description),
                tags: req.tags,
            };
            state.snapshots.insert(snapshot_id.clone(), snapshot);
        }
        state.operations.push(Operation::CreateSnapshot {
            snapshot_id: snapshot_id.clone(),
            volume_id: req.volume_id,
        });
        Ok(snapshot_id)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudProviderError> {
        let mut state = self.state();
        if state.volumes.remove(volume_id).is_none() {
            return Err(not_found("InvalidVolume.NotFound", volume_id));
        }
        state.operations.push(Operation::DeleteVolume {
            volume_id: volume_id.to_string(),
        });
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudProviderError> {
        let mut state = self.state();
        if state.snapshots.remove(snapshot_id).is_none() {
            return Err(not_found("InvalidSnapshot.NotFound", snapshot_id));
        }
        state.operations.push(Operation::DeleteSnapshot {
            snapshot_id: snapshot_id.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl DnsBackend for MemoryCloud {
    async fn upsert_record(
        &self,
        zone_id: &str,
        record: &RecordSet,
    ) -> Result<(), CloudProviderError> {
        let mut state = self.state();
        state.records.insert(
            (zone_id.to_string(), record.name.clone()),
            record.clone(),
        );
        state.operations.push(Operation::UpsertRecord {
            name: record.name.clone(),
            values: record.values.clone(),
        });
        Ok(())
    }

    async fn delete_record(
        &self,
        zone_id: &str,
        record: &RecordSet,
    ) -> Result<(), CloudProviderError> {
        let mut state = self.state();
        let key = (zone_id.to_string(), record.name.clone());
        let matches = state
            .records
            .get(&key)
            .is_some_and(|stored| stored.values == record.values);
        if !matches {
            return Err(CloudProviderError::Api {
                status: 400,
                code: "InvalidChangeBatch".to_string(),
                message: format!("record {} not found", record.name),
            });
        }
        state.records.remove(&key);
        state.operations.push(Operation::DeleteRecord {
            name: record.name.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerBackend for MemoryCloud {
    async fn register_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> Result<(), CloudProviderError> {
        let mut state = self.state();
        let registered = state
            .targets
            .entry(target_group_arn.to_string())
            .or_default();
        for target in targets {
            if !registered.iter().any(|t| t.id == target.id) {
                registered.push(target.clone());
            }
        }
        state.operations.push(Operation::RegisterTargets {
            ids: targets.iter().map(|t| t.id.clone()).collect(),
        });
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> Result<(), CloudProviderError> {
        let mut state = self.state();
        if let Some(registered) = state.targets.get_mut(target_group_arn) {
            registered.retain(|t| !targets.iter().any(|d| d.id == t.id));
        }
        state.operations.push(Operation::DeregisterTargets {
            ids: targets.iter().map(|t| t.id.clone()).collect(),
        });
        Ok(())
    }

    async fn describe_target_health(
        &self,
        target_group_arn: &str,
    ) -> Result<Vec<TargetHealth>, CloudProviderError> {
        Ok(self
            .targets(target_group_arn)
            .into_iter()
            .map(|target| TargetHealth {
                target,
                state: "healthy".to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl LockBackend for MemoryCloud {
    async fn put_lock(
        &self,
        table: &str,
        record: &LockRecord,
        condition: PutCondition,
    ) -> Result<PutOutcome, CloudProviderError> {
        let mut state = self.state();
        let key = (table.to_string(), record.lock_id.clone());
        let writable = match (state.locks.get(&key), condition) {
            (None, _) => true,
            (Some(_), PutCondition::NotExists) => false,
            (Some(expires_at), PutCondition::NotExistsOrExpired { now }) => *expires_at < now,
        };
        if !writable {
            return Ok(PutOutcome::ConditionFailed);
        }
        state.locks.insert(key, record.expires_at);
        state.operations.push(Operation::PutLock {
            lock_id: record.lock_id.clone(),
        });
        Ok(PutOutcome::Written)
    }

    async fn delete_lock(&self, table: &str, lock_id: &str) -> Result<(), CloudProviderError> {
        let mut state = self.state();
        state
            .locks
            .remove(&(table.to_string(), lock_id.to_string()));
        state.operations.push(Operation::DeleteLock {
            lock_id: lock_id.to_string(),
        });
        Ok(())
    }
}
