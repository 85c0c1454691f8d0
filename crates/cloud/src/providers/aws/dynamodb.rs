//! Lock table writes (DynamoDB JSON API).

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use super::client::{Aws, Service};
use super::models::{AttributeValue, DeleteItemRequest, PutItemRequest};
use crate::providers::traits::{
    CloudProviderError, LockBackend, LockRecord, PutCondition, PutOutcome,
};

const TARGET_PREFIX: &str = "DynamoDB_20120810";
const JSON_VERSION: &str = "1.0";

const KEY_ATTRIBUTE: &str = "LockID";
const EXPIRY_ATTRIBUTE: &str = "ExpiresAt";

const CONDITION_FAILED: &str = "ConditionalCheckFailedException";

fn put_item_request<'a>(
    table: &'a str,
    record: &LockRecord,
    condition: PutCondition,
) -> PutItemRequest<'a> {
    let item = BTreeMap::from([
        (KEY_ATTRIBUTE, AttributeValue::S(record.lock_id.clone())),
        (
            EXPIRY_ATTRIBUTE,
            AttributeValue::N(record.expires_at.to_string()),
        ),
    ]);

    let (condition_expression, expression_attribute_values) = match condition {
        PutCondition::NotExists => ("attribute_not_exists(LockID)", None),
        PutCondition::NotExistsOrExpired { now } => (
            "attribute_not_exists(LockID) OR ExpiresAt < :now",
            Some(BTreeMap::from([(":now", AttributeValue::N(now.to_string()))])),
        ),
    };

    PutItemRequest {
        table_name: table,
        item,
        condition_expression,
        expression_attribute_values,
    }
}

#[async_trait]
impl LockBackend for Aws {
    async fn put_lock(
        &self,
        table: &str,
        record: &LockRecord,
        condition: PutCondition,
    ) -> Result<PutOutcome, CloudProviderError> {
        let request = put_item_request(table, record, condition);
        let result: Result<serde_json::Value, _> = self
            .json_call(
                Service::DynamoDb,
                JSON_VERSION,
                &format!("{TARGET_PREFIX}.PutItem"),
                &request,
            )
            .await;

        match result {
            Ok(_) => Ok(PutOutcome::Written),
            Err(CloudProviderError::Api { code, .. }) if code == CONDITION_FAILED => {
                debug!(table, lock_id = %record.lock_id, "Lock condition failed");
                Ok(PutOutcome::ConditionFailed)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_lock(&self, table: &str, lock_id: &str) -> Result<(), CloudProviderError> {
        let request = DeleteItemRequest {
            table_name: table,
            key: BTreeMap::from([(KEY_ATTRIBUTE, AttributeValue::S(lock_id.to_string()))]),
        };
        let _: serde_json::Value = self
            .json_call(
                Service::DynamoDb,
                JSON_VERSION,
                &format!("{TARGET_PREFIX}.DeleteItem"),
                &request,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::aws::Credentials;
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
        .with_endpoint(Service::DynamoDb, server.uri())
    }

    fn record() -> LockRecord {
        LockRecord {
            lock_id: "replica-controller-lock".to_string(),
            expires_at: 1_700_000_060,
        }
    }

    #[test]
    fn test_put_item_request_shape() {
        let value =
            serde_json::to_value(put_item_request("locks", &record(), PutCondition::NotExists))
                .unwrap();
        assert_eq!(value["TableName"], "locks");
        assert_eq!(value["Item"]["LockID"]["S"], "replica-controller-lock");
        assert_eq!(value["Item"]["ExpiresAt"]["N"], "1700000060");
        assert_eq!(value["ConditionExpression"], "attribute_not_exists(LockID)");
        assert!(value.get("ExpressionAttributeValues").is_none());

        let reclaim = serde_json::to_value(put_item_request(
            "locks",
            &record(),
            PutCondition::NotExistsOrExpired { now: 42 },
        ))
        .unwrap();
        assert_eq!(reclaim["ExpressionAttributeValues"][":now"]["N"], "42");
    }

    #[tokio::test]
    async fn test_put_lock_written() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", "DynamoDB_20120810.PutItem"))
            .and(body_partial_json(serde_json::json!({"TableName": "locks"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let outcome = aws_for(&server)
            .put_lock("locks", &record(), PutCondition::NotExists)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Written);
    }

    #[tokio::test]
    async fn test_put_lock_condition_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"__type":"com.amazonaws.dynamodb.v20120810#ConditionalCheckFailedException","message":"The conditional request failed"}"#,
            ))
            .mount(&server)
            .await;

        let outcome = aws_for(&server)
            .put_lock("locks", &record(), PutCondition::NotExists)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::ConditionFailed);
    }

    #[tokio::test]
    async fn test_put_lock_other_errors_propagate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"__type":"com.amazonaws.dynamodb.v20120810#ResourceNotFoundException","message":"table missing"}"#,
            ))
            .mount(&server)
            .await;

        let err = aws_for(&server)
            .put_lock("locks", &record(), PutCondition::NotExists)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
