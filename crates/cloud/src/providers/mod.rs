//! Backend abstractions.
//!
//! This module defines the traits the controller runs against and their
//! two implementations: AWS and an in-memory cloud.

pub mod aws;
pub mod memory;
mod traits;

pub use traits::{
    Attachment, CloudProviderError, ComputeBackend, CreateSnapshotRequest, DesiredStatus,
    DnsBackend, EnvironmentVariable, LoadBalancerBackend, LockBackend, LockRecord,
    ManagedVolume, PutCondition, PutOutcome, RecordSet, RecordType, RunTaskRequest, Snapshot,
    SnapshotFilter, SnapshotState, StorageBackend, TagFilter, Tags, Target, TargetHealth, Task,
    TaskStatus, Volume, VolumeFilter, VolumeState, BLOCK_STORAGE_ATTACHMENT,
    NETWORK_INTERFACE_ATTACHMENT,
};

pub use aws::Aws;
pub use memory::MemoryCloud;
