//! ECS task operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::client::{Aws, Service};
use super::models::{
    AwsVpcConfiguration, ContainerOverride, DescribeTasksRequest, EbsTagSpecification,
    EcsRunTaskRequest, EcsTag, EcsTask, KeyValuePair, ListTasksRequest, ListTasksResponse,
    ManagedEbsVolume, NetworkConfiguration, StopTaskRequest, TaskOverride,
    TaskVolumeConfiguration, TasksResponse, TerminationPolicy,
};
use crate::providers::traits::{
    Attachment, CloudProviderError, ComputeBackend, DesiredStatus, RunTaskRequest, Tags, Task,
    TaskStatus,
};

const TARGET_PREFIX: &str = "AmazonEC2ContainerServiceV20141113";
const JSON_VERSION: &str = "1.1";

/// DescribeTasks accepts at most this many ARNs per call.
const DESCRIBE_BATCH: usize = 100;

fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    #[allow(clippy::cast_possible_truncation)]
    let millis = (secs * 1000.0).round() as i64;
    DateTime::from_timestamp_millis(millis)
}

fn to_ecs_tags(tags: &Tags) -> Vec<EcsTag> {
    tags.iter()
        .map(|(k, v)| EcsTag {
            key: Some(k.clone()),
            value: Some(v.clone()),
        })
        .collect()
}

fn from_ecs_task(task: EcsTask) -> Task {
    let tags = task
        .tags
        .into_iter()
        .filter_map(|t| Some((t.key?, t.value.unwrap_or_default())))
        .collect();
    let attachments = task
        .attachments
        .into_iter()
        .map(|a| Attachment {
            attachment_type: a.attachment_type.unwrap_or_default(),
            details: a
                .details
                .into_iter()
                .filter_map(|d| Some((d.name?, d.value.unwrap_or_default())))
                .collect(),
        })
        .collect();

    Task {
        arn: task.task_arn,
        last_status: task
            .last_status
            .as_deref()
            .map_or(TaskStatus::Unknown, TaskStatus::parse),
        tags,
        attachments,
        created_at: task.created_at.and_then(epoch_to_datetime),
        stopped_at: task.stopped_at.and_then(epoch_to_datetime),
    }
}

fn to_ecs_run_task(req: RunTaskRequest) -> EcsRunTaskRequest {
    let volume_configurations = req
        .volume
        .into_iter()
        .map(|volume| TaskVolumeConfiguration {
            name: volume.name,
            managed_ebs_volume: ManagedEbsVolume {
                size_in_gib: volume.size_gib,
                snapshot_id: volume.snapshot_id,
                role_arn: volume.role_arn,
                termination_policy: TerminationPolicy {
                    delete_on_termination: false,
                },
                tag_specifications: vec![EbsTagSpecification {
                    resource_type: "volume",
                    tags: to_ecs_tags(&volume.tags),
                }],
            },
        })
        .collect();

    EcsRunTaskRequest {
        cluster: req.cluster,
        task_definition: req.task_definition,
        launch_type: "FARGATE",
        count: 1,
        enable_execute_command: req.enable_execute_command,
        network_configuration: NetworkConfiguration {
            awsvpc_configuration: AwsVpcConfiguration {
                subnets: req.subnets,
                security_groups: req.security_groups,
            },
        },
        overrides: TaskOverride {
            container_overrides: vec![ContainerOverride {
                name: req.container_name,
                environment: req
                    .environment
                    .into_iter()
                    .map(|e| KeyValuePair {
                        name: Some(e.name),
                        value: Some(e.value),
                    })
                    .collect(),
            }],
        },
        volume_configurations,
        tags: to_ecs_tags(&req.tags),
    }
}

impl Aws {
    async fn ecs_call<B: serde::Serialize + Sync, T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<T, CloudProviderError> {
        self.json_call(
            Service::Ecs,
            JSON_VERSION,
            &format!("{TARGET_PREFIX}.{operation}"),
            body,
        )
        .await
    }
}

#[async_trait]
impl ComputeBackend for Aws {
    async fn list_tasks(
        &self,
        cluster: &str,
        desired_status: DesiredStatus,
    ) -> Result<Vec<String>, CloudProviderError> {
        let mut arns = Vec::new();
        let mut next_token = None;

        loop {
            let request = ListTasksRequest {
                cluster,
                desired_status: desired_status.as_str(),
                next_token,
            };
            let page: ListTasksResponse = self.ecs_call("ListTasks", &request).await?;
            arns.extend(page.task_arns);
            next_token = page.next_token;
            if next_token.is_none() {
                break;
            }
        }

        debug!(cluster, status = desired_status.as_str(), count = arns.len(), "Listed tasks");
        Ok(arns)
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> Result<Vec<Task>, CloudProviderError> {
        let mut tasks = Vec::with_capacity(task_arns.len());

        for chunk in task_arns.chunks(DESCRIBE_BATCH) {
            let request = DescribeTasksRequest {
                cluster,
                tasks: chunk,
                include: vec!["TAGS"],
            };
            let response: TasksResponse = self.ecs_call("DescribeTasks", &request).await?;
            for failure in &response.failures {
                debug!(
                    arn = ?failure.arn,
                    reason = ?failure.reason,
                    "DescribeTasks reported a failure"
                );
            }
            tasks.extend(response.tasks.into_iter().map(from_ecs_task));
        }

        Ok(tasks)
    }

    async fn run_task(&self, req: RunTaskRequest) -> Result<String, CloudProviderError> {
        let cluster = req.cluster.clone();
        let request = to_ecs_run_task(req);
        let response: TasksResponse = self.ecs_call("RunTask", &request).await?;

        if let Some(task) = response.tasks.into_iter().next() {
            info!(cluster = %cluster, task_arn = %task.task_arn, "Task launched");
            return Ok(task.task_arn);
        }

        let reason = response
            .failures
            .iter()
            .map(|f| {
                format!(
                    "{} {}",
                    f.reason.as_deref().unwrap_or("unknown"),
                    f.detail.as_deref().unwrap_or_default()
                )
                .trim()
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(CloudProviderError::Api {
            status: 200,
            code: "RunTaskFailure".to_string(),
            message: if reason.is_empty() {
                "RunTask returned no task".to_string()
            } else {
                reason
            },
        })
    }

    async fn stop_task(
        &self,
        cluster: &str,
        task_arn: &str,
        reason: &str,
    ) -> Result<(), CloudProviderError> {
        let request = StopTaskRequest {
            cluster,
            task: task_arn,
            reason,
        };
        let _: serde_json::Value = self.ecs_call("StopTask", &request).await?;
        info!(cluster, task_arn, "Task stop requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::aws::Credentials;
    use crate::providers::traits::{EnvironmentVariable, ManagedVolume};
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn aws_for(server: &MockServer) -> Aws {
        Aws::new(
            Credentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
            "us-east-1",
        )
        .unwrap()
        .with_endpoint(Service::Ecs, server.uri())
    }

    #[tokio::test]
    async fn test_list_tasks_follows_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(
                "x-amz-target",
                "AmazonEC2ContainerServiceV20141113.ListTasks",
            ))
            .and(body_partial_json(serde_json::json!({"nextToken": "page-2"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"taskArns": ["arn:task/2"]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header(
                "x-amz-target",
                "AmazonEC2ContainerServiceV20141113.ListTasks",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"taskArns": ["arn:task/1"], "nextToken": "page-2"}),
            ))
            .mount(&server)
            .await;

        let arns = aws_for(&server)
            .list_tasks("cluster", DesiredStatus::Running)
            .await
            .unwrap();
        assert_eq!(arns, vec!["arn:task/1", "arn:task/2"]);
    }

    #[tokio::test]
    async fn test_describe_tasks_maps_tags_and_attachments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"include": ["TAGS"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tasks": [{
                    "taskArn": "arn:task/1",
                    "lastStatus": "STOPPED",
                    "stoppedAt": 1_700_000_000.5,
                    "tags": [{"key": "ess:db:index", "value": "0"}],
                    "attachments": [{
                        "type": "ElasticNetworkInterface",
                        "details": [{"name": "privateIPv4Address", "value": "10.0.0.9"}]
                    }]
                }],
                "failures": []
            })))
            .mount(&server)
            .await;

        let tasks = aws_for(&server)
            .describe_tasks("cluster", &["arn:task/1".to_string()])
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.last_status, TaskStatus::Stopped);
        assert_eq!(task.tags.get("ess:db:index").map(String::as_str), Some("0"));
        assert_eq!(task.private_ip(), Some("10.0.0.9"));
        assert_eq!(
            task.stopped_at.unwrap().timestamp_millis(),
            1_700_000_000_500
        );
    }

    #[tokio::test]
    async fn test_run_task_sends_managed_volume() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(
                "x-amz-target",
                "AmazonEC2ContainerServiceV20141113.RunTask",
            ))
            .and(body_partial_json(serde_json::json!({
                "launchType": "FARGATE",
                "count": 1,
                "volumeConfigurations": [{
                    "name": "volume",
                    "managedEBSVolume": {
                        "sizeInGiB": 20,
                        "snapshotId": "snap-1",
                        "terminationPolicy": {"deleteOnTermination": false}
                    }
                }]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"tasks": [{"taskArn": "arn:task/new"}]})),
            )
            .mount(&server)
            .await;

        let req = RunTaskRequest {
            cluster: "cluster".to_string(),
            task_definition: "td".to_string(),
            container_name: "app".to_string(),
            subnets: vec!["subnet-1".to_string()],
            security_groups: vec!["sg-1".to_string()],
            environment: vec![EnvironmentVariable {
                name: "NODE".to_string(),
                value: "db-0".to_string(),
            }],
            enable_execute_command: false,
            volume: Some(ManagedVolume {
                name: "volume".to_string(),
                size_gib: 20,
                snapshot_id: Some("snap-1".to_string()),
                role_arn: "arn:role".to_string(),
                tags: Tags::new(),
            }),
            tags: Tags::new(),
        };

        let arn = aws_for(&server).run_task(req).await.unwrap();
        assert_eq!(arn, "arn:task/new");
    }

    #[tokio::test]
    async fn test_run_task_failure_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tasks": [],
                "failures": [{"reason": "RESOURCE:ENI"}]
            })))
            .mount(&server)
            .await;

        let req = RunTaskRequest {
            cluster: "cluster".to_string(),
            task_definition: "td".to_string(),
            container_name: "app".to_string(),
            subnets: vec![],
            security_groups: vec![],
            environment: vec![],
            enable_execute_command: false,
            volume: None,
            tags: Tags::new(),
        };

        let err = aws_for(&server).run_task(req).await.unwrap_err();
        assert!(err.to_string().contains("RESOURCE:ENI"));
    }
}
