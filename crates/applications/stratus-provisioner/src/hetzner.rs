//! Hetzner Cloud provider client
//!
//! Talks to the Hetzner Cloud REST API (`/v1/servers` and the catalogue
//! endpoints used for template verification).
//!
//! ## Error mapping
//!
//! | Response | Result |
//! |---|---|
//! | 404 | `NotFound` |
//! | 408, 429, 5xx, network failure | `Transient` |
//! | `locked`, `conflict`, `rate_limit_exceeded`, ... error codes | `Transient` |
//! | any other 4xx (`invalid_input`, `resource_limit_exceeded`, ...) | `Permanent` |

use crate::error::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use stratus_core::{
    ProviderClient, ProviderError, ProviderResult, ResourceKind, ServerId, ServerInfo, ServerSpec,
    ServerStatus,
};
use tracing::{debug, info};

/// Public API endpoint
pub const DEFAULT_API_URL: &str = "https://api.hetzner.cloud/v1";

/// Page size for list calls (API maximum is 50)
const PER_PAGE: u32 = 50;

/// Error codes the API documents as worth retrying
const TRANSIENT_CODES: &[&str] = &[
    "conflict",
    "locked",
    "rate_limit_exceeded",
    "resource_unavailable",
    "server_error",
    "timeout",
    "unavailable",
];

#[derive(Debug, Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    location: &'a str,
    labels: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    start_after_create: bool,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: HcloudServer,
}

#[derive(Debug, Deserialize)]
struct ServerPage {
    servers: Vec<HcloudServer>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct HcloudServer {
    id: u64,
    name: String,
    status: ServerStatus,
    #[serde(default)]
    public_net: PublicNet,
    #[serde(default)]
    private_net: Vec<IpEntry>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct PublicNet {
    ipv4: Option<IpEntry>,
    ipv6: Option<IpEntry>,
}

#[derive(Debug, Deserialize)]
struct IpEntry {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

impl HcloudServer {
    /// Public IPv4, else the first host of the IPv6 network, else a private IP
    fn address(&self) -> Option<String> {
        if let Some(v4) = &self.public_net.ipv4 {
            return Some(v4.ip.clone());
        }
        if let Some(v6) = &self.public_net.ipv6 {
            let network = v6.ip.split('/').next().unwrap_or(&v6.ip);
            return Some(if network.ends_with("::") {
                format!("{}1", network)
            } else {
                network.to_string()
            });
        }
        self.private_net.first().map(|net| net.ip.clone())
    }

    fn into_info(self) -> ServerInfo {
        let address = self.address();
        ServerInfo {
            id: ServerId::new(self.id.to_string()),
            name: self.name,
            status: self.status,
            address,
            labels: self.labels,
        }
    }
}

/// Map a non-success response to a provider error
fn classify(status: StatusCode, body: &str) -> ProviderError {
    let (code, message) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => (String::new(), body.trim().to_string()),
    };
    let detail = if code.is_empty() {
        format!("HTTP {}: {}", status.as_u16(), message)
    } else {
        format!("HTTP {} {}: {}", status.as_u16(), code, message)
    };

    if status == StatusCode::NOT_FOUND {
        ProviderError::not_found(detail)
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || TRANSIENT_CODES.contains(&code.as_str())
    {
        ProviderError::transient(detail)
    } else {
        ProviderError::permanent(detail)
    }
}

/// Hetzner Cloud API client
pub struct HetznerClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
    label_selector: Option<String>,
}

impl HetznerClient {
    /// Create a client; `timeout` bounds every HTTP request
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stratus/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            token: token.into(),
            label_selector: None,
        })
    }

    /// Restrict `list_servers` to servers matching a label selector
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ProviderResult<reqwest::Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ProviderResult<T> {
        response
            .json()
            .await
            .map_err(|e| ProviderError::transient(format!("unreadable response: {}", e)))
    }

    /// Whether a catalogue collection has an entry named `name`
    async fn catalogue_has(&self, collection: &str, name: &str) -> ProviderResult<bool> {
        let request = self
            .client
            .get(self.url(collection))
            .query(&[("name", name)]);
        let body: serde_json::Value = Self::decode(self.send(request).await?).await?;
        Ok(body[collection].as_array().is_some_and(|items| !items.is_empty()))
    }
}

#[async_trait]
impl ProviderClient for HetznerClient {
    fn name(&self) -> &str {
        "hetzner"
    }

    async fn create_server(&self, spec: &ServerSpec) -> ProviderResult<ServerInfo> {
        let body = CreateServerRequest {
            name: &spec.name,
            server_type: &spec.server_type,
            image: &spec.image,
            location: &spec.location,
            labels: &spec.labels,
            user_data: spec.user_data.as_deref(),
            start_after_create: true,
        };

        let request = self.client.post(self.url("servers")).json(&body);
        let envelope: ServerEnvelope = Self::decode(self.send(request).await?).await?;
        let info = envelope.server.into_info();

        info!(server_id = %info.id, name = %info.name, status = %info.status, "Hetzner server created");
        Ok(info)
    }

    async fn get_server(&self, id: &ServerId) -> ProviderResult<ServerInfo> {
        let request = self.client.get(self.url(&format!("servers/{}", id)));
        let envelope: ServerEnvelope = Self::decode(self.send(request).await?).await?;
        Ok(envelope.server.into_info())
    }

    async fn delete_server(&self, id: &ServerId) -> ProviderResult<()> {
        let request = self.client.delete(self.url(&format!("servers/{}", id)));
        match self.send(request).await {
            Ok(_) => Ok(()),
            Err(ProviderError::NotFound(_)) => {
                debug!(server_id = %id, "Server already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_servers(&self) -> ProviderResult<Vec<ServerInfo>> {
        let mut servers = Vec::new();
        let mut page = 1;

        loop {
            let mut request = self
                .client
                .get(self.url("servers"))
                .query(&[("page", page), ("per_page", PER_PAGE)]);
            if let Some(selector) = &self.label_selector {
                request = request.query(&[("label_selector", selector)]);
            }

            let body: ServerPage = Self::decode(self.send(request).await?).await?;
            servers.extend(body.servers.into_iter().map(HcloudServer::into_info));

            match body.meta.and_then(|m| m.pagination).and_then(|p| p.next_page) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        debug!(count = servers.len(), "Listed Hetzner servers");
        Ok(servers)
    }

    async fn verify_resource(&self, kind: ResourceKind, name: &str) -> ProviderResult<Option<bool>> {
        let collection = match kind {
            ResourceKind::Location => "locations",
            ResourceKind::Image => "images",
            ResourceKind::ServerType => "server_types",
        };
        self.catalogue_has(collection, name).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(json: &str) -> ServerInfo {
        serde_json::from_str::<HcloudServer>(json).unwrap().into_info()
    }

    #[test]
    fn test_server_with_public_ipv4() {
        let info = server(
            r#"{
                "id": 4711,
                "name": "small-1a2b3c4d",
                "status": "running",
                "public_net": {
                    "ipv4": { "ip": "1.2.3.4", "blocked": false },
                    "ipv6": { "ip": "2001:db8::/64" }
                },
                "private_net": [],
                "labels": { "stratus/pool": "ci" }
            }"#,
        );

        assert_eq!(info.id, ServerId::new("4711"));
        assert_eq!(info.status, ServerStatus::Running);
        assert_eq!(info.address.as_deref(), Some("1.2.3.4"));
        assert_eq!(info.labels.get("stratus/pool").map(String::as_str), Some("ci"));
        assert!(info.is_reachable());
    }

    #[test]
    fn test_ipv6_only_server_uses_first_host() {
        let info = server(
            r#"{
                "id": 1, "name": "v6", "status": "running",
                "public_net": { "ipv4": null, "ipv6": { "ip": "2001:db8:1:2::/64" } }
            }"#,
        );
        assert_eq!(info.address.as_deref(), Some("2001:db8:1:2::1"));
    }

    #[test]
    fn test_private_only_server() {
        let info = server(
            r#"{
                "id": 2, "name": "private", "status": "starting",
                "public_net": { "ipv4": null, "ipv6": null },
                "private_net": [{ "ip": "10.0.0.7", "network": 9 }]
            }"#,
        );
        assert_eq!(info.address.as_deref(), Some("10.0.0.7"));
        assert!(!info.is_reachable());
    }

    #[test]
    fn test_initializing_server_has_no_address() {
        let info = server(r#"{ "id": 3, "name": "new", "status": "initializing" }"#);
        assert_eq!(info.address, None);
        assert!(info.labels.is_empty());
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify(
            StatusCode::NOT_FOUND,
            r#"{"error": {"code": "not_found", "message": "server not found"}}"#,
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_transient_statuses() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(classify(status, "").is_transient(), "{}", status);
        }
    }

    #[test]
    fn test_classify_transient_codes() {
        let err = classify(
            StatusCode::LOCKED,
            r#"{"error": {"code": "locked", "message": "server is locked"}}"#,
        );
        assert!(err.is_transient());

        let err = classify(
            StatusCode::CONFLICT,
            r#"{"error": {"code": "conflict", "message": "resource changed"}}"#,
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_permanent() {
        let err = classify(
            StatusCode::FORBIDDEN,
            r#"{"error": {"code": "resource_limit_exceeded", "message": "server limit reached"}}"#,
        );
        assert_eq!(
            err,
            ProviderError::permanent("HTTP 403 resource_limit_exceeded: server limit reached")
        );

        let err = classify(StatusCode::BAD_REQUEST, "not json");
        assert!(matches!(err, ProviderError::Permanent(msg) if msg == "HTTP 400: not json"));
    }

    #[test]
    fn test_create_request_body() {
        let spec = ServerSpec::new("small-1", "cx22", "ubuntu-22.04", "fsn1").with_label("stratus/pool", "ci");
        let body = CreateServerRequest {
            name: &spec.name,
            server_type: &spec.server_type,
            image: &spec.image,
            location: &spec.location,
            labels: &spec.labels,
            user_data: spec.user_data.as_deref(),
            start_after_create: true,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["labels"]["stratus/pool"], "ci");
        assert_eq!(json["server_type"], "cx22");
        assert!(json.get("user_data").is_none());
    }

    #[test]
    fn test_page_parsing() {
        let page: ServerPage = serde_json::from_str(
            r#"{
                "servers": [{ "id": 1, "name": "a", "status": "off" }],
                "meta": { "pagination": { "page": 1, "per_page": 50, "next_page": 2, "last_page": 2 } }
            }"#,
        )
        .unwrap();
        assert_eq!(page.servers.len(), 1);
        assert_eq!(page.meta.and_then(|m| m.pagination).and_then(|p| p.next_page), Some(2));
    }

    #[test]
    fn test_url_join() {
        let client = HetznerClient::new("https://api.example.test/v1/", "token", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/servers/7"), "https://api.example.test/v1/servers/7");
        assert_eq!(client.url("locations"), "https://api.example.test/v1/locations");
    }
}
