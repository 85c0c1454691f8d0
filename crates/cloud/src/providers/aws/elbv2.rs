//! Target group registration (ELBv2 Query API).

use async_trait::async_trait;
use serde::de::IgnoredAny;
use tracing::info;

use super::client::{Aws, Service};
use super::models::DescribeTargetHealthResponse;
use crate::providers::traits::{CloudProviderError, LoadBalancerBackend, Target, TargetHealth};

const API_VERSION: &str = "2015-12-01";

fn target_params(target_group_arn: &str, targets: &[Target]) -> Vec<(String, String)> {
    let mut params = vec![("TargetGroupArn".to_string(), target_group_arn.to_string())];
    for (i, target) in targets.iter().enumerate() {
        let n = i + 1;
        params.push((format!("Targets.member.{n}.Id"), target.id.clone()));
        if let Some(port) = target.port {
            params.push((format!("Targets.member.{n}.Port"), port.to_string()));
        }
    }
    params
}

#[async_trait]
impl LoadBalancerBackend for Aws {
    async fn register_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> Result<(), CloudProviderError> {
        let params = target_params(target_group_arn, targets);
        let _: IgnoredAny = self
            .query_call(
                Service::ElasticLoadBalancing,
                "RegisterTargets",
                API_VERSION,
                &params,
            )
            .await?;
        info!(target_group_arn, count = targets.len(), "Targets registered");
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> Result<(), CloudProviderError> {
        let params = target_params(target_group_arn, targets);
        let _: IgnoredAny = self
            .query_call(
                Service::ElasticLoadBalancing,
                "DeregisterTargets",
                API_VERSION,
                &params,
            )
            .await?;
        info!(target_group_arn, count = targets.len(), "Targets deregistered");
        Ok(())
    }

    async fn describe_target_health(
        &self,
        target_group_arn: &str,
    ) -> Result<Vec<TargetHealth>, CloudProviderError> {
        let params = target_params(target_group_arn, &[]);
        let response: DescribeTargetHealthResponse = self
            .query_call(
                Service::ElasticLoadBalancing,
                "DescribeTargetHealth",
                API_VERSION,
                &params,
            )
            .await?;

        Ok(response
            .result
            .descriptions
            .map(|d| d.members)
            .unwrap_or_default()
            .into_iter()
            .map(|d| TargetHealth {
                target: Target {
                    id: d.target.id,
                    port: d.target.port,
                },
                state: d
                    .target_health
                    .and_then(|h| h.state)
                    .unwrap_or_else(|| "unknown".to_string()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::aws::Credentials;
    use wiremock::matchers::{body_string_contains, method};
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
        .with_endpoint(Service::ElasticLoadBalancing, server.uri())
    }

    #[test]
    fn test_target_params() {
        let params = target_params(
            "arn:tg",
            &[Target {
                id: "10.0.0.5".to_string(),
                port: Some(80),
            }],
        );
        assert!(params.contains(&("Targets.member.1.Id".to_string(), "10.0.0.5".to_string())));
        assert!(params.contains(&("Targets.member.1.Port".to_string(), "80".to_string())));
    }

    #[tokio::test]
    async fn test_describe_target_health() {
        let server = MockServer::start().await;
        let body = r#"<DescribeTargetHealthResponse xmlns="http://elasticloadbalancing.amazonaws.com/doc/2015-12-01/">
  <DescribeTargetHealthResult>
    <TargetHealthDescriptions>
      <member>
        <Target><Id>10.0.0.5</Id><Port>80</Port></Target>
        <TargetHealth><State>healthy</State></TargetHealth>
      </member>
      <member>
        <Target><Id>10.0.0.6</Id><Port>80</Port></Target>
        <TargetHealth><State>draining</State></TargetHealth>
      </member>
    </TargetHealthDescriptions>
  </DescribeTargetHealthResult>
  <ResponseMetadata><RequestId>r-1</RequestId></ResponseMetadata>
</DescribeTargetHealthResponse>"#;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=DescribeTargetHealth"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let health = aws_for(&server).describe_target_health("arn:tg").await.unwrap();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].target.id, "10.0.0.5");
        assert_eq!(health[0].target.port, Some(80));
        assert_eq!(health[1].state, "draining");
    }
}
