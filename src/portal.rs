//! Portal Client
//!
//! The portal is the remote policy service that decides whether a user may
//! connect. The decision path only depends on the [`PortalClient`] trait;
//! [`HttpPortalClient`] is the JSON-over-HTTPS transport used by the agent
//! binary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{AgentError, Result};

/// Portal policy verdict
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalVerdict {
    pub allowed: bool,
    /// Deny reason; empty when allowed
    #[serde(default, alias = "deny_reason")]
    pub reason: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

impl PortalVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            ..Default::default()
        }
    }
}

/// Remote policy check contract
#[async_trait]
pub trait PortalClient: Send + Sync {
    /// Ask the portal whether `username` in `group` may connect from `client_ip`.
    ///
    /// Callers bound this with their own deadline by dropping the future.
    async fn check_policy(&self, username: &str, group: &str, client_ip: &str)
        -> Result<PortalVerdict>;
}

/// HTTP portal configuration
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Base URL, e.g. `https://portal.example.net`
    pub base_url: String,
    /// Bearer token for the agent
    pub token: Option<String>,
    /// Transport-level request timeout
    pub timeout: Duration,
    /// PEM bundle trusted in addition to the webpki roots (private portal CA)
    pub ca_cert: Option<PathBuf>,
    /// PEM client certificate for mutual TLS; requires `client_key`
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`
    pub client_key: Option<PathBuf>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://127.0.0.1:8443".to_string(),
            token: None,
            timeout: Duration::from_secs(10),
            ca_cert: None,
            client_cert: None,
            client_key: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct CheckPolicyRequest<'a> {
    username: &'a str,
    groupname: &'a str,
    client_ip: &'a str,
    request_time: String,
}

/// JSON-over-HTTPS portal client
#[derive(Debug, Clone)]
pub struct HttpPortalClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpPortalClient {
    pub fn new(config: &PortalConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(AgentError::Config("portal address is required".into()));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("ocserv-agent/", env!("CARGO_PKG_VERSION")));

        if let Some(path) = &config.ca_cert {
            let pem = read_pem("CA certificate", path)?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| AgentError::Config(format!("parse portal CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }

        match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem("client certificate", cert)?;
                pem.push(b'\n');
                pem.extend_from_slice(&read_pem("client key", key)?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| AgentError::Config(format!("load portal client identity: {}", e)))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(AgentError::Config(
                    "portal client certificate and key must be set together".into(),
                ))
            }
        }

        let http = builder
            .build()
            .map_err(|e| AgentError::Config(format!("build portal client: {}", e)))?;

        tracing::info!(
            endpoint = %config.base_url,
            custom_ca = config.ca_cert.is_some(),
            mutual_tls = config.client_cert.is_some(),
            "portal client configured"
        );

        Ok(Self {
            http,
            endpoint: format!("{}/api/v1/policy/check", config.base_url.trim_end_matches('/')),
            token: config.token.clone(),
        })
    }
}

fn read_pem(what: &str, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| AgentError::Config(format!("read portal {} {}: {}", what, path.display(), e)))
}

#[async_trait]
impl PortalClient for HttpPortalClient {
    async fn check_policy(
        &self,
        username: &str,
        group: &str,
        client_ip: &str,
    ) -> Result<PortalVerdict> {
        let body = CheckPolicyRequest {
            username,
            groupname: group,
            client_ip,
            request_time: chrono::Utc::now().to_rfc3339(),
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::portal("check_policy", format!("request timed out: {}", e))
            } else {
                AgentError::portal("check_policy", format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::portal(
                "check_policy",
                format!("unexpected status {}", status),
            ));
        }

        let verdict: PortalVerdict = response
            .json()
            .await
            .map_err(|e| AgentError::portal("check_policy", format!("decode response: {}", e)))?;

        if verdict.allowed {
            tracing::info!(
                username,
                routes_count = verdict.routes.len(),
                dns_count = verdict.dns_servers.len(),
                "access allowed by portal"
            );
        } else {
            tracing::warn!(username, reason = %verdict.reason, "access denied by portal");
        }

        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, token: Option<&str>) -> HttpPortalClient {
        HttpPortalClient::new(&PortalConfig {
            base_url: server.uri(),
            token: token.map(str::to_string),
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_check_policy_allowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/policy/check"))
            .and(header("authorization", "Bearer agent-token"))
            .and(body_partial_json(serde_json::json!({
                "username": "alice",
                "groupname": "staff",
                "client_ip": "203.0.113.9"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "allowed": true,
                "routes": ["10.0.0.0/8"],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("agent-token"));
        let verdict = client.check_policy("alice", "staff", "203.0.113.9").await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.routes, vec!["10.0.0.0/8".to_string()]);
    }

    #[tokio::test]
    async fn test_check_policy_denied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/policy/check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "allowed": false,
                "deny_reason": "account disabled",
            })))
            .mount(&server)
            .await;

        let verdict = client_for(&server, None)
            .check_policy("mallory", "", "203.0.113.66")
            .await
            .unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, "account disabled");
    }

    #[tokio::test]
    async fn test_server_error_is_portal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .check_policy("alice", "staff", "203.0.113.9")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Portal { op: "check_policy", .. }));
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn test_malformed_body_is_portal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .check_policy("alice", "staff", "203.0.113.9")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Portal { .. }));
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let err = HttpPortalClient::new(&PortalConfig {
            base_url: String::new(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_missing_ca_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = HttpPortalClient::new(&PortalConfig {
            ca_cert: Some(dir.path().join("portal-ca.pem")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(&err, AgentError::Config(msg) if msg.contains("CA certificate")));
    }

    #[test]
    fn test_client_cert_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("agent.pem");
        std::fs::write(&cert, b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n").unwrap();

        let err = HttpPortalClient::new(&PortalConfig {
            client_cert: Some(cert),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(&err, AgentError::Config(msg) if msg.contains("set together")));

        let err = HttpPortalClient::new(&PortalConfig {
            client_key: Some(dir.path().join("agent.key")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_missing_client_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("agent.pem");
        std::fs::write(&cert, b"placeholder").unwrap();

        let err = HttpPortalClient::new(&PortalConfig {
            client_cert: Some(cert),
            client_key: Some(dir.path().join("agent.key")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(&err, AgentError::Config(msg) if msg.contains("client key")));
    }
}
