//! DNS records and load balancer targets for live replicas.

use std::collections::BTreeSet;
use std::sync::Arc;

use ess_cloud::{DnsBackend, LoadBalancerBackend, RecordSet, RecordType, Target};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compute::ActiveReplica;
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::tags::ReplicaIndex;

/// What one network sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkReport {
    /// Record names upserted.
    pub records_upserted: Vec<String>,
    /// Target addresses newly registered.
    pub targets_registered: Vec<String>,
    /// Target addresses removed because no live replica owns them.
    pub targets_deregistered: Vec<String>,
    /// Replicas skipped for lack of an address.
    pub skipped: Vec<ReplicaIndex>,
}

/// Keeps per-replica DNS records and target membership in line with the
/// live replica set.
pub struct NetworkReconciler {
    dns: Arc<dyn DnsBackend>,
    load_balancer: Arc<dyn LoadBalancerBackend>,
    config: Arc<ControllerConfig>,
}

impl NetworkReconciler {
    #[must_use]
    pub fn new(
        dns: Arc<dyn DnsBackend>,
        load_balancer: Arc<dyn LoadBalancerBackend>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            dns,
            load_balancer,
            config,
        }
    }

    /// Record name of `index`: `<set>-<index>.<domain>`.
    #[must_use]
    pub fn record_name(&self, index: ReplicaIndex) -> String {
        format!(
            "{}-{index}.{}",
            self.config.set_name,
            self.config.dns_domain.trim_end_matches('.')
        )
    }

    fn record(&self, index: ReplicaIndex, ip: &str) -> RecordSet {
        RecordSet {
            name: self.record_name(index),
            record_type: RecordType::A,
            ttl: self.config.timings.dns_ttl,
            values: vec![ip.to_string()],
        }
    }

    fn target(&self, ip: &str) -> Target {
        Target {
            id: ip.to_string(),
            port: self.config.target_port,
        }
    }

    /// Point the replica's record at its address.
    ///
    /// Returns `false` without calling the backend when the replica has no
    /// address yet.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn upsert_record(&self, replica: &ActiveReplica) -> Result<bool> {
        let Some(ip) = replica.private_ip() else {
            warn!(index = %replica.index, task_arn = %replica.task_arn(), "No address for replica, skipping DNS record");
            return Ok(false);
        };
        let record = self.record(replica.index, ip);
        self.dns
            .upsert_record(&self.config.hosted_zone_id, &record)
            .await?;
        debug!(name = %record.name, ip, "DNS record upserted");
        Ok(true)
    }

    /// Remove the replica's record. Failures are logged and ignored.
    pub async fn delete_record(&self, replica: &ActiveReplica) {
        let Some(ip) = replica.private_ip() else {
            warn!(index = %replica.index, "No address for replica, skipping DNS delete");
            return;
        };
        let record = self.record(replica.index, ip);
        match self
            .dns
            .delete_record(&self.config.hosted_zone_id, &record)
            .await
        {
            Ok(()) => info!(name = %record.name, "DNS record deleted"),
            Err(e) => warn!(name = %record.name, error = %e, "Failed to delete DNS record"),
        }
    }

    /// Register the replica's address with the target group.
    ///
    /// # Errors
    /// Returns an error if registration fails.
    pub async fn register_target(&self, replica: &ActiveReplica) -> Result<bool> {
        let Some(ip) = replica.private_ip() else {
            warn!(index = %replica.index, "No address for replica, skipping target registration");
            return Ok(false);
        };
        self.load_balancer
            .register_targets(&self.config.target_group_arn, &[self.target(ip)])
            .await?;
        info!(index = %replica.index, ip, "Target registered");
        Ok(true)
    }

    /// Remove the replica's address from the target group.
    ///
    /// # Errors
    /// Returns an error if deregistration fails.
    pub async fn deregister_target(&self, replica: &ActiveReplica) -> Result<bool> {
        let Some(ip) = replica.private_ip() else {
            warn!(index = %replica.index, "No address for replica, skipping target deregistration");
            return Ok(false);
        };
        self.load_balancer
            .deregister_targets(&self.config.target_group_arn, &[self.target(ip)])
            .await?;
        info!(index = %replica.index, ip, "Target deregistered");
        Ok(true)
    }

    /// Upsert a record for every live replica and register any address the
    /// target group does not already hold.
    ///
    /// # Errors
    /// Returns an error if a backend call fails.
    pub async fn sync_live(&self, live: &[ActiveReplica]) -> Result<NetworkReport> {
        let mut report = NetworkReport::default();
        let registered: BTreeSet<String> = self
            .load_balancer
            .describe_target_health(&self.config.target_group_arn)
            .await?
            .into_iter()
            .map(|h| h.target.id)
            .collect();

        for replica in live {
            if !self.upsert_record(replica).await? {
                report.skipped.push(replica.index);
                continue;
            }
            report.records_upserted.push(self.record_name(replica.index));

            let Some(ip) = replica.private_ip() else {
                continue;
            };
            if registered.contains(ip) {
                continue;
            }
            if self.register_target(replica).await? {
                report.targets_registered.push(ip.to_string());
            }
        }

        Ok(report)
    }

    /// Deregister every target whose address belongs to no live replica.
    ///
    /// # Errors
    /// Returns an error if describing or deregistering targets fails.
    pub async fn prune_drift(&self, live: &[ActiveReplica]) -> Result<Vec<Target>> {
        let live_ips: BTreeSet<&str> = live.iter().filter_map(ActiveReplica::private_ip).collect();

        let stale: Vec<Target> = self
            .load_balancer
            .describe_target_health(&self.config.target_group_arn)
            .await?
            .into_iter()
            .map(|h| h.target)
            .filter(|t| !live_ips.contains(t.id.as_str()))
            .collect();

        if stale.is_empty() {
            return Ok(stale);
        }

        info!(
            targets = ?stale.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            "Deregistering targets with no live replica"
        );
        self.load_balancer
            .deregister_targets(&self.config.target_group_arn, &stale)
            .await?;
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_cloud::memory::Operation;
    use ess_cloud::{Attachment, MemoryCloud, Task, TaskStatus, Tags};

    fn config() -> Arc<ControllerConfig> {
        Arc::new(ControllerConfig {
            set_name: "db".to_string(),
            hosted_zone_id: "Z1".to_string(),
            dns_domain: "internal.example.".to_string(),
            target_group_arn: "arn:tg".to_string(),
            target_port: Some(5432),
            ..ControllerConfig::default()
        })
    }

    fn reconciler(cloud: &Arc<MemoryCloud>) -> NetworkReconciler {
        NetworkReconciler::new(cloud.clone(), cloud.clone(), config())
    }

    fn replica(index: u32, ip: Option<&str>) -> ActiveReplica {
        ActiveReplica::new(
            ReplicaIndex::new(index),
            Task {
                arn: format!("arn:task/{index}"),
                last_status: TaskStatus::Running,
                tags: Tags::new(),
                attachments: ip.map(Attachment::network_interface).into_iter().collect(),
                created_at: None,
                stopped_at: None,
            },
        )
    }

    #[test]
    fn test_record_name() {
        let cloud = Arc::new(MemoryCloud::new());
        assert_eq!(
            reconciler(&cloud).record_name(ReplicaIndex::new(3)),
            "db-3.internal.example"
        );
    }

    #[tokio::test]
    async fn test_sync_live_registers_each_address_once() {
        let cloud = Arc::new(MemoryCloud::new());
        let network = reconciler(&cloud);
        let live = vec![replica(0, Some("10.0.0.1")), replica(1, Some("10.0.0.2"))];

        let report = network.sync_live(&live).await.unwrap();
        assert_eq!(report.records_upserted.len(), 2);
        assert_eq!(report.targets_registered, vec!["10.0.0.1", "10.0.0.2"]);

        let records = cloud.records("Z1");
        assert_eq!(records[0].name, "db-0.internal.example");
        assert_eq!(records[0].ttl, 5);
        assert_eq!(records[0].values, vec!["10.0.0.1"]);
        assert_eq!(cloud.targets("arn:tg")[0].port, Some(5432));

        let again = network.sync_live(&live).await.unwrap();
        assert!(again.targets_registered.is_empty());
        assert_eq!(cloud.targets("arn:tg").len(), 2);
    }

    #[tokio::test]
    async fn test_sync_live_skips_replica_without_address() {
        let cloud = Arc::new(MemoryCloud::new());
        let report = reconciler(&cloud)
            .sync_live(&[replica(0, None)])
            .await
            .unwrap();

        assert_eq!(report.skipped, vec![ReplicaIndex::new(0)]);
        assert!(cloud.operations().is_empty());
    }

    #[tokio::test]
    async fn test_prune_drift_converges_to_live_set() {
        let cloud = Arc::new(MemoryCloud::new());
        let network = reconciler(&cloud);
        for index in 0..4 {
            network
                .register_target(&replica(index, Some(&format!("10.0.0.{index}"))))
                .await
                .unwrap();
        }

        let live = vec![replica(0, Some("10.0.0.0")), replica(2, Some("10.0.0.2"))];
        let removed = network.prune_drift(&live).await.unwrap();
        assert_eq!(removed.len(), 2);

        let remaining: Vec<String> = cloud.targets("arn:tg").into_iter().map(|t| t.id).collect();
        assert_eq!(remaining, vec!["10.0.0.0", "10.0.0.2"]);
        assert!(network.prune_drift(&live).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_record_is_not_an_error() {
        let cloud = Arc::new(MemoryCloud::new());
        reconciler(&cloud)
            .delete_record(&replica(1, Some("10.0.0.9")))
            .await;
        assert!(!cloud
            .operations()
            .iter()
            .any(|op| matches!(op, Operation::DeleteRecord { .. })));
    }
}
