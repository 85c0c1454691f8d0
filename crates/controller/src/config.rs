//! Controller configuration.
//!
//! One [`ControllerConfig`] is built per process and shared by every
//! component; nothing reads the environment after startup.

use std::collections::BTreeMap;
use std::time::Duration;

use ess_cloud::EnvironmentVariable;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tags::ReplicaIndex;

/// Placeholder replaced by the replica index in environment values.
pub const INDEX_PLACEHOLDER: &str = "$index";

/// Default size of each replica's volume.
pub const DEFAULT_VOLUME_SIZE_GIB: u32 = 20;

/// Poll intervals, bounds and ages used by the control cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Lifetime written into the lock entry.
    pub lock_ttl: Duration,
    /// How long after stopping a task is still considered settling.
    pub in_flight_grace: Duration,
    /// Detached volumes younger than this are left alone.
    pub orphan_min_age: Duration,
    /// Interval between snapshot visibility checks.
    pub snapshot_poll_interval: Duration,
    /// Bound on waiting for a new snapshot to become visible.
    pub snapshot_timeout: Duration,
    /// Interval between task visibility checks.
    pub task_poll_interval: Duration,
    /// Bound on waiting for a launched task to become visible.
    pub task_timeout: Duration,
    /// Interval between private address checks.
    pub address_poll_interval: Duration,
    /// Bound on waiting for a launched task's private address.
    pub address_timeout: Duration,
    /// TTL of replica DNS records, in seconds.
    pub dns_ttl: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            in_flight_grace: Duration::from_secs(10 * 60),
            orphan_min_age: Duration::from_secs(2 * 60),
            snapshot_poll_interval: Duration::from_secs(3),
            snapshot_timeout: Duration::from_secs(60),
            task_poll_interval: Duration::from_secs(3),
            task_timeout: Duration::from_secs(120),
            address_poll_interval: Duration::from_secs(1),
            address_timeout: Duration::from_secs(120),
            dns_ttl: 5,
        }
    }
}

/// Configuration of one replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Replica set name; scopes tags and DNS names.
    pub set_name: String,
    /// Cluster running the replica tasks.
    pub cluster: String,
    /// Task definition ARN.
    pub task_definition_arn: String,
    /// Container receiving environment overrides.
    pub container_name: String,
    /// Target replica count.
    pub desired_replicas: u32,
    /// Table holding the controller lock.
    pub lock_table: String,
    /// Subnets for replica network interfaces.
    pub subnet_ids: Vec<String>,
    /// Security group for replica network interfaces.
    pub security_group_id: String,
    /// Hosted zone for replica records.
    pub hosted_zone_id: String,
    /// Domain appended to replica record names.
    pub dns_domain: String,
    /// Target group replicas are registered with.
    pub target_group_arn: String,
    /// Port to register targets on; the target group's port when unset.
    pub target_port: Option<u16>,
    /// Role the platform assumes to manage replica volumes.
    pub volume_role_arn: String,
    /// Per-replica environment; `$index` in values becomes the index.
    pub environment: BTreeMap<String, String>,
    /// Size of each replica volume in GiB.
    pub volume_size_gib: u32,
    /// Enable interactive command execution on replica tasks.
    pub enable_execute_command: bool,
    /// Let an expired lock entry be taken over instead of waiting for its
    /// holder to delete it.
    pub reclaim_expired_lock: bool,
    /// Poll intervals and bounds.
    pub timings: Timings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            set_name: String::new(),
            cluster: String::new(),
            task_definition_arn: String::new(),
            container_name: String::new(),
            desired_replicas: 0,
            lock_table: String::new(),
            subnet_ids: Vec::new(),
            security_group_id: String::new(),
            hosted_zone_id: String::new(),
            dns_domain: String::new(),
            target_group_arn: String::new(),
            target_port: None,
            volume_role_arn: String::new(),
            environment: BTreeMap::new(),
            volume_size_gib: DEFAULT_VOLUME_SIZE_GIB,
            enable_execute_command: false,
            reclaim_expired_lock: false,
            timings: Timings::default(),
        }
    }
}

impl ControllerConfig {
    /// Check that every required field is usable.
    ///
    /// A desired replica count of zero is valid.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("set name", &self.set_name),
            ("cluster", &self.cluster),
            ("task definition ARN", &self.task_definition_arn),
            ("container name", &self.container_name),
            ("lock table", &self.lock_table),
            ("security group id", &self.security_group_id),
            ("hosted zone id", &self.hosted_zone_id),
            ("DNS domain", &self.dns_domain),
            ("target group ARN", &self.target_group_arn),
            ("volume role ARN", &self.volume_role_arn),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ConfigError::Missing(*name));
        }
        if self.subnet_ids.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::NoSubnets);
        }
        if self.volume_size_gib == 0 {
            return Err(ConfigError::ZeroVolumeSize);
        }
        Ok(())
    }

    /// Parse the per-replica environment from a JSON object of strings.
    ///
    /// # Errors
    /// Returns an error if `json` is not an object of string values.
    pub fn parse_environment(json: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        if json.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(json).map_err(|e| ConfigError::Environment(e.to_string()))
    }

    /// Environment overrides for the replica at `index`.
    #[must_use]
    pub fn environment_for(&self, index: ReplicaIndex) -> Vec<EnvironmentVariable> {
        let index = index.to_string();
        self.environment
            .iter()
            .map(|(name, value)| EnvironmentVariable {
                name: name.clone(),
                value: value.replace(INDEX_PLACEHOLDER, &index),
            })
            .collect()
    }
}
