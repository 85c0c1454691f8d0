//! AWS API request and response models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// ECS (JSON 1.1) types
// ============================================================================

/// ListTasks request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksRequest<'a> {
    pub cluster: &'a str,
    pub desired_status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// ListTasks response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResponse {
    #[serde(default)]
    pub task_arns: Vec<String>,
    pub next_token: Option<String>,
}

/// DescribeTasks request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeTasksRequest<'a> {
    pub cluster: &'a str,
    pub tasks: &'a [String],
    pub include: Vec<&'static str>,
}

/// Response carrying tasks (DescribeTasks, RunTask).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksResponse {
    #[serde(default)]
    pub tasks: Vec<EcsTask>,
    #[serde(default)]
    pub failures: Vec<EcsFailure>,
}

/// ECS task description.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsTask {
    pub task_arn: String,
    pub last_status: Option<String>,
    #[serde(default)]
    pub tags: Vec<EcsTag>,
    #[serde(default)]
    pub attachments: Vec<EcsAttachment>,
    /// Epoch seconds.
    pub created_at: Option<f64>,
    /// Epoch seconds.
    pub stopped_at: Option<f64>,
}

/// ECS resource tag (lower-case keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcsTag {
    pub key: Option<String>,
    pub value: Option<String>,
}

/// ECS task attachment.
#[derive(Debug, Clone, Deserialize)]
pub struct EcsAttachment {
    #[serde(rename = "type")]
    pub attachment_type: Option<String>,
    #[serde(default)]
    pub details: Vec<KeyValuePair>,
}

/// Name/value pair (attachment details, environment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub name: Option<String>,
    pub value: Option<String>,
}

/// ECS API failure entry.
#[derive(Debug, Clone, Deserialize)]
pub struct EcsFailure {
    pub arn: Option<String>,
    pub reason: Option<String>,
    pub detail: Option<String>,
}

/// RunTask request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsRunTaskRequest {
    pub cluster: String,
    pub task_definition: String,
    pub launch_type: &'static str,
    pub count: u32,
    pub enable_execute_command: bool,
    pub network_configuration: NetworkConfiguration,
    pub overrides: TaskOverride,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volume_configurations: Vec<TaskVolumeConfiguration>,
    pub tags: Vec<EcsTag>,
}

/// Task network configuration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfiguration {
    pub awsvpc_configuration: AwsVpcConfiguration,
}

/// awsvpc network mode settings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsVpcConfiguration {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
}

/// Task overrides.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOverride {
    pub container_overrides: Vec<ContainerOverride>,
}

/// Container override.
#[derive(Debug, Serialize)]
pub struct ContainerOverride {
    pub name: String,
    pub environment: Vec<KeyValuePair>,
}

/// Volume configuration supplied at launch.
#[derive(Debug, Serialize)]
pub struct TaskVolumeConfiguration {
    pub name: String,
    #[serde(rename = "managedEBSVolume")]
    pub managed_ebs_volume: ManagedEbsVolume,
}

/// Managed EBS volume created with the task.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedEbsVolume {
    #[serde(rename = "sizeInGiB")]
    pub size_in_gib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    pub role_arn: String,
    pub termination_policy: TerminationPolicy,
    pub tag_specifications: Vec<EbsTagSpecification>,
}

/// What happens to the volume when the task stops.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationPolicy {
    pub delete_on_termination: bool,
}

/// Tags for the created volume.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EbsTagSpecification {
    pub resource_type: &'static str,
    pub tags: Vec<EcsTag>,
}

/// StopTask request.
#[derive(Debug, Serialize)]
pub struct StopTaskRequest<'a> {
    pub cluster: &'a str,
    pub task: &'a str,
    pub reason: &'a str,
}

// ============================================================================
// DynamoDB (JSON 1.0) types
// ============================================================================

/// DynamoDB attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttributeValue {
    S(String),
    N(String),
}

/// PutItem request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutItemRequest<'a> {
    pub table_name: &'a str,
    pub item: BTreeMap<&'static str, AttributeValue>,
    pub condition_expression: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression_attribute_values: Option<BTreeMap<&'static str, AttributeValue>>,
}

/// DeleteItem request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteItemRequest<'a> {
    pub table_name: &'a str,
    pub key: BTreeMap<&'static str, AttributeValue>,
}

// ============================================================================
// EC2 (Query, XML) types
// ============================================================================

/// `<xxxSet><item>..</item></xxxSet>` list wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    pub items: Vec<T>,
}

/// EC2 tag.
#[derive(Debug, Clone, Deserialize)]
pub struct Ec2Tag {
    pub key: String,
    pub value: Option<String>,
}

/// DescribeVolumes response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeVolumesResponse {
    pub volume_set: Option<ItemSet<Ec2Volume>>,
    pub next_token: Option<String>,
}

/// EBS volume.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ec2Volume {
    pub volume_id: String,
    pub size: Option<u32>,
    pub status: String,
    pub create_time: Option<String>,
    pub tag_set: Option<ItemSet<Ec2Tag>>,
}

/// DescribeSnapshots response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeSnapshotsResponse {
    pub snapshot_set: Option<ItemSet<Ec2Snapshot>>,
    pub next_token: Option<String>,
}

/// EBS snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ec2Snapshot {
    pub snapshot_id: String,
    pub volume_id: Option<String>,
    pub status: String,
    pub start_time: Option<String>,
    pub description: Option<String>,
    pub tag_set: Option<ItemSet<Ec2Tag>>,
}

/// CreateSnapshot response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotResponse {
    pub snapshot_id: String,
}

// ============================================================================
// ELBv2 (Query, XML) types
// ============================================================================

/// `<Xxx><member>..</member></Xxx>` list wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberSet<T> {
    #[serde(rename = "member", default = "Vec::new")]
    pub members: Vec<T>,
}

/// DescribeTargetHealth response.
#[derive(Debug, Deserialize)]
pub struct DescribeTargetHealthResponse {
    #[serde(rename = "DescribeTargetHealthResult")]
    pub result: DescribeTargetHealthResult,
}

/// DescribeTargetHealth result element.
#[derive(Debug, Deserialize)]
pub struct DescribeTargetHealthResult {
    #[serde(rename = "TargetHealthDescriptions")]
    pub descriptions: Option<MemberSet<TargetHealthDescription>>,
}

/// One registered target.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetHealthDescription {
    pub target: ElbTarget,
    pub target_health: Option<ElbTargetHealth>,
}

/// Target id and port.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ElbTarget {
    pub id: String,
    pub port: Option<u16>,
}

/// Target health state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ElbTargetHealth {
    pub state: Option<String>,
}
