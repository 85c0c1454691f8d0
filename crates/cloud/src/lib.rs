//! Cloud backends for the ESS replica controller.
//!
//! The controller manages a set of numbered replicas, each a container task
//! with its own block volume, DNS record and load balancer target. It only
//! talks to the outside world through the traits in [`providers`]:
//!
//! - [`ComputeBackend`] - run, stop and describe tasks
//! - [`StorageBackend`] - volumes and snapshots
//! - [`DnsBackend`] - per-replica address records
//! - [`LoadBalancerBackend`] - target group membership
//! - [`LockBackend`] - the conditional write backing the controller lock
//!
//! [`Aws`] implements them against ECS, EC2, Route 53, ELBv2 and DynamoDB.
//! [`MemoryCloud`] implements them in process for tests and dry runs.

pub mod providers;

pub use providers::{
    aws, memory, Attachment, Aws, CloudProviderError, ComputeBackend, CreateSnapshotRequest,
    DesiredStatus, DnsBackend, EnvironmentVariable, LoadBalancerBackend, LockBackend,
    LockRecord, ManagedVolume, MemoryCloud, PutCondition, PutOutcome, RecordSet, RecordType,
    RunTaskRequest, Snapshot, SnapshotFilter, SnapshotState, StorageBackend, TagFilter, Tags,
    Target, TargetHealth, Task, TaskStatus, Volume, VolumeFilter, VolumeState,
};
