//! EBS volume and snapshot operations (EC2 Query API).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use tracing::{debug, info};

use super::client::{Aws, Service};
use super::models::{
    CreateSnapshotResponse, DescribeSnapshotsResponse, DescribeVolumesResponse, Ec2Snapshot,
    Ec2Tag, Ec2Volume, ItemSet,
};
use crate::providers::traits::{
    CloudProviderError, CreateSnapshotRequest, Snapshot, SnapshotFilter, SnapshotState,
    StorageBackend, TagFilter, Tags, Volume, VolumeFilter, VolumeState,
};

const API_VERSION: &str = "2016-11-15";
const PAGE_SIZE: &str = "500";

type Params = Vec<(String, String)>;

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn tags_from(set: Option<ItemSet<Ec2Tag>>) -> Tags {
    set.map(|s| s.items)
        .unwrap_or_default()
        .into_iter()
        .map(|t| (t.key, t.value.unwrap_or_default()))
        .collect()
}

/// Append `Filter.N.*` parameters starting at filter number `first`.
fn push_filters(params: &mut Params, first: usize, filters: &[(String, Vec<String>)]) {
    for (offset, (name, values)) in filters.iter().enumerate() {
        let n = first + offset;
        params.push((format!("Filter.{n}.Name"), name.clone()));
        for (m, value) in values.iter().enumerate() {
            params.push((format!("Filter.{n}.Value.{}", m + 1), value.clone()));
        }
    }
}

fn tag_filters(tags: &[TagFilter]) -> Vec<(String, Vec<String>)> {
    tags.iter()
        .map(|t| (format!("tag:{}", t.key), t.values.clone()))
        .collect()
}

fn volume_params(filter: &VolumeFilter) -> Params {
    let mut params = Params::new();
    for (i, id) in filter.ids.iter().enumerate() {
        params.push((format!("VolumeId.{}", i + 1), id.clone()));
    }

    let mut filters = Vec::new();
    if !filter.states.is_empty() {
        filters.push((
            "status".to_string(),
            filter.states.iter().map(|s| s.as_str().to_string()).collect(),
        ));
    }
    filters.extend(tag_filters(&filter.tags));
    push_filters(&mut params, 1, &filters);
    params
}

fn snapshot_params(filter: &SnapshotFilter) -> Params {
    let mut params = vec![("Owner.1".to_string(), "self".to_string())];
    for (i, id) in filter.ids.iter().enumerate() {
        params.push((format!("SnapshotId.{}", i + 1), id.clone()));
    }

    let mut filters = Vec::new();
    if !filter.states.is_empty() {
        filters.push((
            "status".to_string(),
            filter.states.iter().map(|s| s.as_str().to_string()).collect(),
        ));
    }
    filters.extend(tag_filters(&filter.tags));
    push_filters(&mut params, 1, &filters);
    params
}

fn from_ec2_volume(volume: Ec2Volume) -> Volume {
    Volume {
        state: VolumeState::parse(&volume.status),
        create_time: parse_time(volume.create_time.as_deref()),
        size_gib: volume.size,
        tags: tags_from(volume.tag_set),
        id: volume.volume_id,
    }
}

fn from_ec2_snapshot(snapshot: Ec2Snapshot) -> Snapshot {
    Snapshot {
        state: SnapshotState::parse(&snapshot.status),
        start_time: parse_time(snapshot.start_time.as_deref()),
        volume_id: snapshot.volume_id.filter(|v| !v.is_empty()),
        description: snapshot.description,
        tags: tags_from(snapshot.tag_set),
        id: snapshot.snapshot_id,
    }
}

impl Aws {
    /// Run a paginated EC2 describe call, feeding `NextToken` back until the
    /// service stops returning one.
    async fn describe_all<R, T>(
        &self,
        action: &str,
        base: &Params,
        paginate: bool,
        split: impl Fn(R) -> (Vec<T>, Option<String>),
    ) -> Result<Vec<T>, CloudProviderError>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut out = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut params = base.clone();
            if paginate {
                params.push(("MaxResults".to_string(), PAGE_SIZE.to_string()));
            }
            if let Some(token) = next_token.take() {
                params.push(("NextToken".to_string(), token));
            }

            let response: R = self
                .query_call(Service::Ec2, action, API_VERSION, &params)
                .await?;
            let (items, token) = split(response);
            out.extend(items);

            match token.filter(|t| !t.is_empty()) {
                Some(token) if paginate => next_token = Some(token),
                _ => break,
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl StorageBackend for Aws {
    async fn describe_volumes(
        &self,
        filter: &VolumeFilter,
    ) -> Result<Vec<Volume>, CloudProviderError> {
        let volumes = self
            .describe_all(
                "DescribeVolumes",
                &volume_params(filter),
                filter.ids.is_empty(),
                |r: DescribeVolumesResponse| {
                    (
                        r.volume_set.map(|s| s.items).unwrap_or_default(),
                        r.next_token,
                    )
                },
            )
            .await?;

        debug!(count = volumes.len(), "Described volumes");
        Ok(volumes.into_iter().map(from_ec2_volume).collect())
    }

    async fn describe_snapshots(
        &self,
        filter: &SnapshotFilter,
    ) -> Result<Vec<Snapshot>, CloudProviderError> {
        let snapshots = self
            .describe_all(
                "DescribeSnapshots",
                &snapshot_params(filter),
                filter.ids.is_empty(),
                |r: DescribeSnapshotsResponse| {
                    (
                        r.snapshot_set.map(|s| s.items).unwrap_or_default(),
                        r.next_token,
                    )
                },
            )
            .await?;

        debug!(count = snapshots.len(), "Described snapshots");
        Ok(snapshots.into_iter().map(from_ec2_snapshot).collect())
    }

    async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<String, CloudProviderError> {
        let mut params = vec![
            ("VolumeId".to_string(), req.volume_id.clone()),
            ("Description".to_string(), req.description),
        ];
        if !req.tags.is_empty() {
            params.push((
                "TagSpecification.1.ResourceType".to_string(),
                "snapshot".to_string(),
            ));
            for (i, (key, value)) in req.tags.iter().enumerate() {
                params.push((format!("TagSpecification.1.Tag.{}.Key", i + 1), key.clone()));
                params.push((
                    format!("TagSpecification.1.Tag.{}.Value", i + 1),
                    value.clone(),
                ));
            }
        }

        let response: CreateSnapshotResponse = self
            .query_call(Service::Ec2, "CreateSnapshot", API_VERSION, &params)
            .await?;
        info!(volume_id = %req.volume_id, snapshot_id = %response.snapshot_id, "Snapshot started");
        Ok(response.snapshot_id)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudProviderError> {
        let params = vec![("VolumeId".to_string(), volume_id.to_string())];
        let _: IgnoredAny = self
            .query_call(Service::Ec2, "DeleteVolume", API_VERSION, &params)
            .await?;
        info!(volume_id, "Volume deleted");
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudProviderError> {
        let params = vec![("SnapshotId".to_string(), snapshot_id.to_string())];
        let _: IgnoredAny = self
            .query_call(Service::Ec2, "DeleteSnapshot", API_VERSION, &params)
            .await?;
        info!(snapshot_id, "Snapshot deleted");
        Ok(())
    }
}
