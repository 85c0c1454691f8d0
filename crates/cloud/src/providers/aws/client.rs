//! AWS API client implementation.
//!
//! One [`Aws`] value talks to every service the controller uses. Requests are
//! signed with SigV4 and sent with `reqwest`; the three wire protocols in use
//! (JSON, Query and REST-XML) share the signing and error handling below.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use super::sigv4::{self, Credentials, SigningParams};
use crate::providers::traits::CloudProviderError;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Error codes AWS uses for request throttling.
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "PriorRequestNotComplete",
];

/// AWS services used by the replica controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Service {
    /// Elastic Container Service (tasks).
    Ecs,
    /// EC2 (EBS volumes and snapshots).
    Ec2,
    /// Elastic Load Balancing v2 (target groups).
    ElasticLoadBalancing,
    /// Route 53 (DNS records).
    Route53,
    /// DynamoDB (lock table).
    DynamoDb,
}

impl Service {
    /// Name used in the SigV4 credential scope.
    #[must_use]
    pub const fn signing_name(self) -> &'static str {
        match self {
            Self::Ecs => "ecs",
            Self::Ec2 => "ec2",
            Self::ElasticLoadBalancing => "elasticloadbalancing",
            Self::Route53 => "route53",
            Self::DynamoDb => "dynamodb",
        }
    }

    fn default_endpoint(self, region: &str) -> String {
        match self {
            Self::Route53 => "https://route53.amazonaws.com".to_string(),
            _ => format!("https://{}.{region}.amazonaws.com", self.signing_name()),
        }
    }

    /// Route 53 is global and always signs for `us-east-1`.
    fn signing_region(self, region: &str) -> &str {
        match self {
            Self::Route53 => "us-east-1",
            _ => region,
        }
    }
}

/// AWS cloud backend.
#[derive(Clone)]
pub struct Aws {
    /// HTTP client.
    client: Client,
    /// Signing credentials.
    credentials: Credentials,
    /// AWS region.
    region: String,
    /// Endpoint overrides per service.
    endpoints: BTreeMap<Service, String>,
}

impl Aws {
    /// Create a new AWS backend.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        credentials: Credentials,
        region: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(CloudProviderError::Http)?;

        Ok(Self {
            client,
            credentials,
            region: region.into(),
            endpoints: BTreeMap::new(),
        })
    }

    /// Create a backend from the standard AWS environment variables.
    ///
    /// Reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, optional
    /// `AWS_SESSION_TOKEN` and `AWS_REGION` (or `AWS_DEFAULT_REGION`).
    ///
    /// # Errors
    /// Returns error if credentials or region are missing.
    pub fn from_env() -> Result<Self, CloudProviderError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let access_key_id = var("AWS_ACCESS_KEY_ID")
            .ok_or_else(|| CloudProviderError::Auth("AWS_ACCESS_KEY_ID not set".to_string()))?;
        let secret_access_key = var("AWS_SECRET_ACCESS_KEY").ok_or_else(|| {
            CloudProviderError::Auth("AWS_SECRET_ACCESS_KEY not set".to_string())
        })?;
        let region = var("AWS_REGION")
            .or_else(|| var("AWS_DEFAULT_REGION"))
            .ok_or_else(|| CloudProviderError::Config("AWS_REGION not set".to_string()))?;

        Self::new(
            Credentials {
                access_key_id,
                secret_access_key,
                session_token: var("AWS_SESSION_TOKEN"),
            },
            region,
        )
    }

    /// Send requests for `service` to `endpoint` instead of the public one.
    #[must_use]
    pub fn with_endpoint(mut self, service: Service, endpoint: impl Into<String>) -> Self {
        self.endpoints.insert(service, endpoint.into());
        self
    }

    /// Region this backend signs for.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    fn endpoint(&self, service: Service) -> String {
        self.endpoints
            .get(&service)
            .cloned()
            .unwrap_or_else(|| service.default_endpoint(&self.region))
    }

    fn url(&self, service: Service, path: &str) -> Result<Url, CloudProviderError> {
        let base = self.endpoint(service);
        Url::parse(&format!("{}{path}", base.trim_end_matches('/')))
            .map_err(|e| CloudProviderError::Config(format!("invalid endpoint {base}: {e}")))
    }

    /// Call a JSON-protocol API (ECS, DynamoDB).
    pub(crate) async fn json_call<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        service: Service,
        json_version: &str,
        target: &str,
        body: &B,
    ) -> Result<T, CloudProviderError> {
        let payload = serde_json::to_vec(body)?;
        let headers = vec![
            (
                "content-type".to_string(),
                format!("application/x-amz-json-{json_version}"),
            ),
            ("x-amz-target".to_string(), target.to_string()),
        ];
        let url = self.url(service, "/")?;

        let text = self
            .send(service, Method::POST, url, headers, payload, ErrorFormat::Json)
            .await?;
        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| {
            warn!(error = %e, body = %text, target, "Failed to parse response");
            CloudProviderError::Serialization(e)
        })
    }

    /// Call a Query-protocol API (EC2, ELBv2) and decode its XML response.
    pub(crate) async fn query_call<T: DeserializeOwned>(
        &self,
        service: Service,
        action: &str,
        version: &str,
        params: &[(String, String)],
    ) -> Result<T, CloudProviderError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("Action", action)
            .append_pair("Version", version)
            .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        let headers = vec![(
            "content-type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )];
        let url = self.url(service, "/")?;

        let text = self
            .send(
                service,
                Method::POST,
                url,
                headers,
                body.into_bytes(),
                ErrorFormat::Xml,
            )
            .await?;
        decode_xml(&text)
    }

    /// Call a REST-XML API (Route 53), returning the raw response body.
    pub(crate) async fn rest_xml_call(
        &self,
        service: Service,
        method: Method,
        path: &str,
        body: String,
    ) -> Result<String, CloudProviderError> {
        let headers = vec![("content-type".to_string(), "text/xml".to_string())];
        let url = self.url(service, path)?;
        self.send(service, method, url, headers, body.into_bytes(), ErrorFormat::Xml)
            .await
    }

    async fn send(
        &self,
        service: Service,
        method: Method,
        url: Url,
        headers: Vec<(String, String)>,
        payload: Vec<u8>,
        errors: ErrorFormat,
    ) -> Result<String, CloudProviderError> {
        debug!(url = %url, method = %method, service = service.signing_name(), "AWS request");

        let params = SigningParams {
            credentials: &self.credentials,
            region: service.signing_region(&self.region),
            service: service.signing_name(),
            time: Utc::now(),
        };
        let auth = sigv4::sign(method.as_str(), &url, &headers, &payload, &params)?;

        let mut request = self.client.request(method, url);
        for (name, value) in headers.into_iter().chain(auth) {
            request = request.header(name, value);
        }

        let response = request.body(payload).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            Ok(text)
        } else {
            Err(error_from_response(status, &text, errors))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ErrorFormat {
    Json,
    Xml,
}

pub(crate) fn decode_xml<T: DeserializeOwned>(text: &str) -> Result<T, CloudProviderError> {
    quick_xml::de::from_str(text).map_err(|e| {
        warn!(error = %e, body = %text, "Failed to parse XML response");
        CloudProviderError::Xml(e.to_string())
    })
}

/// Text of the first `<name>` element in `body`.
fn element_text(body: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = body.find(&open)? + open.len();
    let len = body.get(start..)?.find(&close)?;
    body.get(start..start + len).map(str::to_string)
}

/// Local name of the document's root element.
fn root_element(body: &str) -> Option<String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(body);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn error_from_response(status: StatusCode, body: &str, format: ErrorFormat) -> CloudProviderError {
    let (code, message) = match format {
        ErrorFormat::Json => {
            let value: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
            let raw = value
                .get("__type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            let code = raw
                .rsplit('#')
                .next()
                .unwrap_or(raw)
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string();
            let message = value
                .get("message")
                .or_else(|| value.get("Message"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or(body)
                .to_string();
            (code, message)
        }
        ErrorFormat::Xml => {
            let code = element_text(body, "Code")
                .or_else(|| root_element(body))
                .unwrap_or_default();
            let message = element_text(body, "Message").unwrap_or_else(|| body.to_string());
            (code, message)
        }
    };

    if THROTTLING_CODES.contains(&code.as_str()) || status == StatusCode::TOO_MANY_REQUESTS {
        CloudProviderError::Throttled(message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        CloudProviderError::Auth(message)
    } else if status == StatusCode::NOT_FOUND && code.is_empty() {
        CloudProviderError::NotFound(message)
    } else {
        CloudProviderError::Api {
            status: status.as_u16(),
            code,
            message,
        }
    }
}
