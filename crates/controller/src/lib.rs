//! ESS replica controller.
//!
//! Keeps a numbered set of container tasks at a desired count. Each replica
//! owns a block volume that is snapshotted once detached and restored when
//! the index is started again, a DNS record and a load balancer target.
//! [`Controller::run_cycle`] performs one lock-protected reconciliation pass.

pub mod compute;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod guard;
pub mod lock;
pub mod network;
mod poll;
pub mod storage;
pub mod tags;

pub use compute::{ActiveReplica, ComputeManager};
pub use config::{ControllerConfig, Timings, DEFAULT_VOLUME_SIZE_GIB, INDEX_PLACEHOLDER};
pub use coordinator::{
    Backends, Controller, CycleOutcome, CycleReport, ReplicaAction, ReplicaStatus, SetStatus,
};
pub use error::{ConfigError, ControllerError, Result};
pub use guard::{InFlight, ReadinessGuard};
pub use lock::{LockManager, LOCK_ID};
pub use network::{NetworkReconciler, NetworkReport};
pub use storage::{StorageReconciler, StorageReport};
pub use tags::{ReplicaIndex, TagSchema};
