//! DNS record changes (Route 53 REST-XML API).

use async_trait::async_trait;
use quick_xml::escape::escape;
use reqwest::Method;
use tracing::info;

use super::client::{Aws, Service};
use crate::providers::traits::{CloudProviderError, DnsBackend, RecordSet};

const API_PATH: &str = "/2013-04-01";
const XMLNS: &str = "https://route53.amazonaws.com/doc/2013-04-01/";

/// Zone ids are accepted with or without the `/hostedzone/` prefix.
fn bare_zone_id(zone_id: &str) -> &str {
    zone_id.trim_start_matches("/hostedzone/")
}

fn change_batch(action: &str, record: &RecordSet) -> String {
    let values: String = record
        .values
        .iter()
        .map(|v| format!("<ResourceRecord><Value>{}</Value></ResourceRecord>", escape(v.as_str())))
        .collect();

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <ChangeResourceRecordSetsRequest xmlns=\"{XMLNS}\">\
         <ChangeBatch><Changes><Change>\
         <Action>{action}</Action>\
         <ResourceRecordSet>\
         <Name>{name}</Name>\
         <Type>{record_type}</Type>\
         <TTL>{ttl}</TTL>\
         <ResourceRecords>{values}</ResourceRecords>\
         </ResourceRecordSet>\
         </Change></Changes></ChangeBatch>\
         </ChangeResourceRecordSetsRequest>",
        name = escape(record.name.as_str()),
        record_type = record.record_type.as_str(),
        ttl = record.ttl,
    )
}

impl Aws {
    async fn change_record(
        &self,
        zone_id: &str,
        action: &str,
        record: &RecordSet,
    ) -> Result<(), CloudProviderError> {
        let path = format!("{API_PATH}/hostedzone/{}/rrset/", bare_zone_id(zone_id));
        self.rest_xml_call(
            Service::Route53,
            Method::POST,
            &path,
            change_batch(action, record),
        )
        .await?;
        info!(zone_id, action, name = %record.name, values = ?record.values, "DNS record changed");
        Ok(())
    }
}

#[async_trait]
impl DnsBackend for Aws {
    async fn upsert_record(
        &self,
        zone_id: &str,
        record: &RecordSet,
    ) -> Result<(), CloudProviderError> {
        self.change_record(zone_id, "UPSERT", record).await
    }

    async fn delete_record(
        &self,
        zone_id: &str,
        record: &RecordSet,
    ) -> Result<(), CloudProviderError> {
        self.change_record(zone_id, "DELETE", record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::aws::Credentials;
    use crate::providers::traits::RecordType;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record() -> RecordSet {
        RecordSet {
            name: "db-0.internal.example".to_string(),
            record_type: RecordType::A,
            ttl: 5,
            values: vec!["10.0.0.5".to_string()],
        }
    }

    #[test]
    fn test_change_batch_body() {
        let body = change_batch("UPSERT", &record());
        assert!(body.contains("<Action>UPSERT</Action>"));
        assert!(body.contains("<Name>db-0.internal.example</Name>"));
        assert!(body.contains("<Type>A</Type>"));
        assert!(body.contains("<TTL>5</TTL>"));
        assert!(body.contains("<Value>10.0.0.5</Value>"));
    }

    #[test]
    fn test_bare_zone_id() {
        assert_eq!(bare_zone_id("/hostedzone/Z123"), "Z123");
        assert_eq!(bare_zone_id("Z123"), "Z123");
    }

    #[tokio::test]
    async fn test_delete_posts_to_zone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2013-04-01/hostedzone/Z123/rrset/"))
            .and(body_string_contains("<Action>DELETE</Action>"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ChangeResourceRecordSetsResponse><ChangeInfo><Id>/change/C1</Id>\
                 </ChangeInfo></ChangeResourceRecordSetsResponse>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let aws = Aws::new(
            Credentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
            "eu-west-1",
        )
        .unwrap()
        .with_endpoint(Service::Route53, server.uri());

        aws.delete_record("/hostedzone/Z123", &record()).await.unwrap();
    }
}
