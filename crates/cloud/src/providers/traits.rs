//! Backend traits and common types.
//!
//! Each trait is one capability the replica controller depends on. The AWS
//! adapters implement them against ECS, EC2/EBS, Route 53, ELBv2 and
//! DynamoDB; [`MemoryCloud`](super::memory::MemoryCloud) implements all of
//! them in process.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during backend operations.
#[derive(Error, Debug)]
pub enum CloudProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// XML response could not be decoded.
    #[error("XML decode error: {0}")]
    Xml(String),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Request was throttled by the service.
    #[error("Throttled: {0}")]
    Throttled(String),
}

impl CloudProviderError {
    /// Whether the error means the addressed resource does not exist.
    ///
    /// AWS reports missing resources either as HTTP 404 or as a 400 with a
    /// `*.NotFound` / `*NotFound` error code.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api { status, code, .. } => *status == 404 || code.ends_with("NotFound"),
            _ => false,
        }
    }
}

/// Tags attached to a resource, keyed by tag key.
pub type Tags = BTreeMap<String, String>;

/// A tag filter: matches resources whose tag `key` has any of `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    /// Tag key.
    pub key: String,
    /// Accepted values.
    pub values: Vec<String>,
}

impl TagFilter {
    /// Filter on a single tag value.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: vec![value.into()],
        }
    }

    /// Whether `tags` satisfy this filter.
    #[must_use]
    pub fn matches(&self, tags: &Tags) -> bool {
        tags.get(&self.key)
            .is_some_and(|value| self.values.iter().any(|v| v == value))
    }
}

// ============================================================================
// Compute (task) types
// ============================================================================

/// Attachment type carrying the task's network interface.
pub const NETWORK_INTERFACE_ATTACHMENT: &str = "ElasticNetworkInterface";

/// Attachment type carrying the task's managed block volume.
pub const BLOCK_STORAGE_ATTACHMENT: &str = "AmazonElasticBlockStorage";

/// Last known lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Provisioning,
    Pending,
    Activating,
    Running,
    Deactivating,
    Stopping,
    Deprovisioning,
    Stopped,
    Deleted,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Parse the platform's upper-case status string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "PROVISIONING" => Self::Provisioning,
            "PENDING" => Self::Pending,
            "ACTIVATING" => Self::Activating,
            "RUNNING" => Self::Running,
            "DEACTIVATING" => Self::Deactivating,
            "STOPPING" => Self::Stopping,
            "DEPROVISIONING" => Self::Deprovisioning,
            "STOPPED" => Self::Stopped,
            "DELETED" => Self::Deleted,
            _ => Self::Unknown,
        }
    }

    /// Platform string for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Pending => "PENDING",
            Self::Activating => "ACTIVATING",
            Self::Running => "RUNNING",
            Self::Deactivating => "DEACTIVATING",
            Self::Stopping => "STOPPING",
            Self::Deprovisioning => "DEPROVISIONING",
            Self::Stopped => "STOPPED",
            Self::Deleted => "DELETED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether the platform is still moving the task between stable states.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Provisioning
                | Self::Pending
                | Self::Deprovisioning
                | Self::Stopping
                | Self::Deactivating
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired status used to list tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredStatus {
    Running,
    Stopped,
}

impl DesiredStatus {
    /// Platform string for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        }
    }
}

/// Opaque attachment metadata reported on a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment type, e.g. [`NETWORK_INTERFACE_ATTACHMENT`].
    pub attachment_type: String,
    /// Name/value details.
    pub details: BTreeMap<String, String>,
}

impl Attachment {
    /// Network interface attachment exposing `address`.
    #[must_use]
    pub fn network_interface(address: impl Into<String>) -> Self {
        Self {
            attachment_type: NETWORK_INTERFACE_ATTACHMENT.to_string(),
            details: BTreeMap::from([("privateIPv4Address".to_string(), address.into())]),
        }
    }

    /// Block storage attachment bound to `volume_id`.
    #[must_use]
    pub fn block_storage(volume_id: impl Into<String>) -> Self {
        Self {
            attachment_type: BLOCK_STORAGE_ATTACHMENT.to_string(),
            details: BTreeMap::from([("volumeId".to_string(), volume_id.into())]),
        }
    }
}

/// A running or recently stopped compute task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task ARN.
    pub arn: String,
    /// Last status reported by the platform.
    pub last_status: TaskStatus,
    /// Task tags.
    pub tags: Tags,
    /// Attachments (network interface, block volume).
    pub attachments: Vec<Attachment>,
    /// When the task was created.
    pub created_at: Option<DateTime<Utc>>,
    /// When the task stopped.
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Private IPv4 address of the task's network interface, once assigned.
    #[must_use]
    pub fn private_ip(&self) -> Option<&str> {
        self.attachment_detail(NETWORK_INTERFACE_ATTACHMENT, "privateIPv4Address")
    }

    /// Id of the block volume bound to the task, if any.
    #[must_use]
    pub fn volume_id(&self) -> Option<&str> {
        self.attachment_detail(BLOCK_STORAGE_ATTACHMENT, "volumeId")
    }

    fn attachment_detail(&self, attachment_type: &str, name: &str) -> Option<&str> {
        self.attachments
            .iter()
            .find(|a| a.attachment_type == attachment_type)
            .and_then(|a| a.details.get(name))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Environment variable override for the task's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// Managed block volume requested alongside a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedVolume {
    /// Volume name as declared in the task definition.
    pub name: String,
    /// Size in GiB.
    pub size_gib: u32,
    /// Snapshot to restore the volume from.
    pub snapshot_id: Option<String>,
    /// Infrastructure role the platform assumes to manage the volume.
    pub role_arn: String,
    /// Tags applied to the created volume.
    pub tags: Tags,
}

/// Request to run a single task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskRequest {
    /// Cluster to run in.
    pub cluster: String,
    /// Task definition ARN.
    pub task_definition: String,
    /// Container receiving the environment overrides.
    pub container_name: String,
    /// Subnets for the task's network interface.
    pub subnets: Vec<String>,
    /// Security groups for the task's network interface.
    pub security_groups: Vec<String>,
    /// Container environment overrides.
    pub environment: Vec<EnvironmentVariable>,
    /// Enable interactive command execution.
    pub enable_execute_command: bool,
    /// Managed volume to create for the task.
    pub volume: Option<ManagedVolume>,
    /// Task tags.
    pub tags: Tags,
}

// ============================================================================
// Block storage types
// ============================================================================

/// Volume state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
    /// Unknown state.
    #[serde(other)]
    Unknown,
}

impl VolumeState {
    /// Parse the service's state string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "creating" => Self::Creating,
            "available" => Self::Available,
            "in-use" => Self::InUse,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Service string for this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume id.
    pub id: String,
    /// Current state.
    pub state: VolumeState,
    /// When the volume was created.
    pub create_time: Option<DateTime<Utc>>,
    /// Size in GiB.
    pub size_gib: Option<u32>,
    /// Volume tags.
    pub tags: Tags,
}

/// Filter for describing volumes. Empty fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    /// Exact volume ids.
    pub ids: Vec<String>,
    /// Accepted states.
    pub states: Vec<VolumeState>,
    /// Tag constraints (all must match).
    pub tags: Vec<TagFilter>,
}

impl VolumeFilter {
    /// Restrict to the given volume id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.ids.push(id.into());
        self
    }

    /// Accept volumes in `state`.
    #[must_use]
    pub fn with_state(mut self, state: VolumeState) -> Self {
        self.states.push(state);
        self
    }

    /// Require tag `key` to equal `value`.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(TagFilter::new(key, value));
        self
    }

    /// Whether `volume` satisfies this filter.
    #[must_use]
    pub fn matches(&self, volume: &Volume) -> bool {
        (self.ids.is_empty() || self.ids.contains(&volume.id))
            && (self.states.is_empty() || self.states.contains(&volume.state))
            && self.tags.iter().all(|t| t.matches(&volume.tags))
    }
}

/// Snapshot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
    Recoverable,
    Recovering,
    /// Unknown state.
    #[serde(other)]
    Unknown,
}

impl SnapshotState {
    /// Parse the service's state string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            "error" => Self::Error,
            "recoverable" => Self::Recoverable,
            "recovering" => Self::Recovering,
            _ => Self::Unknown,
        }
    }

    /// Service string for this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Recoverable => "recoverable",
            Self::Recovering => "recovering",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time copy of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: String,
    /// Source volume id.
    pub volume_id: Option<String>,
    /// Current state.
    pub state: SnapshotState,
    /// When the snapshot was started.
    pub start_time: Option<DateTime<Utc>>,
    /// Description.
    pub description: Option<String>,
    /// Snapshot tags.
    pub tags: Tags,
}

/// Filter for describing snapshots owned by the caller. Empty fields do not
/// constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    /// Exact snapshot ids.
    pub ids: Vec<String>,
    /// Accepted states.
    pub states: Vec<SnapshotState>,
    /// Tag constraints (all must match).
    pub tags: Vec<TagFilter>,
}

impl SnapshotFilter {
    /// Restrict to the given snapshot id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.ids.push(id.into());
        self
    }

    /// Accept snapshots in `state`.
    #[must_use]
    pub fn with_state(mut self, state: SnapshotState) -> Self {
        self.states.push(state);
        self
    }

    /// Require tag `key` to equal `value`.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(TagFilter::new(key, value));
        self
    }

    /// Whether `snapshot` satisfies this filter.
    #[must_use]
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        (self.ids.is_empty() || self.ids.contains(&snapshot.id))
            && (self.states.is_empty() || self.states.contains(&snapshot.state))
            && self.tags.iter().all(|t| t.matches(&snapshot.tags))
    }
}

/// Request to snapshot a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Source volume id.
    pub volume_id: String,
    /// Human readable description.
    pub description: String,
    /// Tags applied to the snapshot at creation.
    pub tags: Tags,
}

// ============================================================================
// DNS and load balancer types
// ============================================================================

/// DNS record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    A,
}

impl RecordType {
    /// Wire name of the record type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
        }
    }
}

/// A DNS record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    /// Fully qualified record name.
    pub name: String,
    /// Record type.
    pub record_type: RecordType,
    /// TTL in seconds.
    pub ttl: u32,
    /// Record values.
    pub values: Vec<String>,
}

/// A load balancer target, registered by address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Target id (an IP address for IP target groups).
    pub id: String,
    /// Port override; the target group's port when absent.
    pub port: Option<u16>,
}

/// A registered target and its health state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealth {
    /// The target.
    pub target: Target,
    /// Health state, e.g. `healthy`, `initial`, `draining`.
    pub state: String,
}

// ============================================================================
// Lock store types
// ============================================================================

/// A lock entry in the key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Lock identifier (the key).
    pub lock_id: String,
    /// Expiry as seconds since the Unix epoch.
    pub expires_at: i64,
}

/// Condition attached to a lock write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// Write only if no entry with the key exists.
    NotExists,
    /// Write if no entry exists or the existing entry expired before `now`.
    NotExistsOrExpired { now: i64 },
}

/// Result of a conditional lock write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry was written.
    Written,
    /// The condition failed; another holder owns the entry.
    ConditionFailed,
}

// ============================================================================
// Backend traits
// ============================================================================

/// Compute platform running the replica tasks.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// List task ARNs in `cluster` with the given desired status.
    async fn list_tasks(
        &self,
        cluster: &str,
        desired_status: DesiredStatus,
    ) -> Result<Vec<String>, CloudProviderError>;

    /// Describe tasks, including their tags. Unknown ARNs are omitted.
    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> Result<Vec<Task>, CloudProviderError>;

    /// Run exactly one task, returning its ARN.
    async fn run_task(&self, req: RunTaskRequest) -> Result<String, CloudProviderError>;

    /// Request that a task stop.
    async fn stop_task(
        &self,
        cluster: &str,
        task_arn: &str,
        reason: &str,
    ) -> Result<(), CloudProviderError>;
}

/// Block storage and snapshot service.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Describe volumes matching `filter`.
    async fn describe_volumes(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<Volume>, CloudProviderError>;

    /// Describe snapshots owned by the caller matching `filter`.
    async fn describe_snapshots(
        &self,
        filter: &SnapshotFilter,
    ) -> Result<Vec<Snapshot>, CloudProviderError>;

    /// Start a snapshot, returning its id.
    async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<String, CloudProviderError>;

    /// Delete a volume.
    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudProviderError>;

    /// Delete a snapshot.
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudProviderError>;
}

/// DNS service hosting the replica records.
#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Create or replace a record set.
    async fn upsert_record(
        &self,
        zone_id: &str,
        record: &RecordSet,
    ) -> Result<(), CloudProviderError>;

    /// Delete a record set. The record must match the stored one.
    async fn delete_record(
        &self,
        zone_id: &str,
        record: &RecordSet,
    ) -> Result<(), CloudProviderError>;
}

/// Load balancer target registration service.
#[async_trait]
pub trait LoadBalancerBackend: Send + Sync {
    /// Register targets with a target group.
    async fn register_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> Result<(), CloudProviderError>;

    /// Deregister targets from a target group.
    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> Result<(), CloudProviderError>;

    /// Describe every target registered with a target group.
    async fn describe_target_health(
        &self,
        target_group_arn: &str,
    ) -> Result<Vec<TargetHealth>, CloudProviderError>;
}

/// Key-value store holding the controller lock.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Conditionally write a lock entry.
    async fn put_lock(
        &self,
        table: &str,
        record: &LockRecord,
        condition: PutCondition,
    ) -> Result<PutOutcome, CloudProviderError>;

    /// Unconditionally delete a lock entry.
    async fn delete_lock(&self, table: &str, lock_id: &str) -> Result<(), CloudProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(attachments: Vec<Attachment>) -> Task {
        Task {
            arn: "arn:aws:ecs:us-east-1:123:task/c/abc".to_string(),
            last_status: TaskStatus::Running,
            tags: Tags::new(),
            attachments,
            created_at: None,
            stopped_at: None,
        }
    }

    #[test]
    fn test_task_status_transitional() {
        assert!(TaskStatus::parse("PROVISIONING").is_transitional());
        assert!(TaskStatus::parse("DEACTIVATING").is_transitional());
        assert!(!TaskStatus::parse("RUNNING").is_transitional());
        assert!(!TaskStatus::parse("STOPPED").is_transitional());
        assert_eq!(TaskStatus::parse("bogus"), TaskStatus::Unknown);
    }

    #[test]
    fn test_task_attachment_lookup() {
        let task = task_with(vec![
            Attachment::block_storage("vol-1"),
            Attachment::network_interface("10.0.1.7"),
        ]);
        assert_eq!(task.private_ip(), Some("10.0.1.7"));
        assert_eq!(task.volume_id(), Some("vol-1"));

        let pending = task_with(vec![Attachment::network_interface("")]);
        assert_eq!(pending.private_ip(), None);
        assert_eq!(pending.volume_id(), None);
    }

    #[test]
    fn test_volume_filter_matches() {
        let volume = Volume {
            id: "vol-1".to_string(),
            state: VolumeState::Available,
            create_time: None,
            size_gib: Some(20),
            tags: Tags::from([("ess:db:index".to_string(), "2".to_string())]),
        };

        assert!(VolumeFilter::default().matches(&volume));
        assert!(VolumeFilter::default()
            .with_state(VolumeState::Available)
            .with_tag("ess:db:index", "2")
            .matches(&volume));
        assert!(!VolumeFilter::default()
            .with_state(VolumeState::InUse)
            .matches(&volume));
        assert!(!VolumeFilter::default()
            .with_tag("ess:db:index", "1")
            .matches(&volume));
    }

    #[test]
    fn test_not_found_classification() {
        let api = CloudProviderError::Api {
            status: 400,
            code: "InvalidSnapshot.NotFound".to_string(),
            message: "gone".to_string(),
        };
        assert!(api.is_not_found());
        assert!(CloudProviderError::NotFound("x".to_string()).is_not_found());
        assert!(!CloudProviderError::Timeout(5).is_not_found());
    }
}
