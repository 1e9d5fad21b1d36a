//! Forwarding allocations to peer clusters.

use std::time::Duration;

use async_trait::async_trait;
use fleetplane_api::{AllocationStatus, GameServerAllocation, Secret};
use reqwest::{Certificate, Identity};
use thiserror::Error;
use tracing::{debug, warn};

/// Path of the allocation endpoint on every cluster.
pub const ALLOCATIONS_PATH: &str = "/v1/allocations";

#[derive(Debug, Error)]
pub enum PeerError {
    /// Could not reach the peer, or it timed out.
    #[error("peer {endpoint} unreachable: {reason}")]
    Transport { endpoint: String, reason: String },

    /// The peer answered with a server error.
    #[error("peer {endpoint} failed with {status}: {body}")]
    Upstream {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The peer refused the request itself.
    #[error("peer {endpoint} rejected the request with {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("invalid credentials for {cluster}: {reason}")]
    Credentials { cluster: String, reason: String },

    #[error("peer {endpoint} sent an unreadable reply: {reason}")]
    Protocol { endpoint: String, reason: String },
}

impl PeerError {
    /// Worth another attempt against the same endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PeerError::Transport { .. } | PeerError::Upstream { .. })
    }
}

/// Everything needed to reach one peer endpoint.
#[derive(Debug, Clone)]
pub struct PeerTarget {
    pub cluster: String,
    pub endpoint: String,

    /// Client certificate and key (`tls.crt`, `tls.key`), and optionally the
    /// peer CA (`ca.crt`).
    pub credentials: Option<Secret>,

    /// PEM CA that overrides the one in `credentials`.
    pub server_ca: Option<String>,
}

impl PeerTarget {
    fn url(&self) -> String {
        let base = self.endpoint.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{base}{ALLOCATIONS_PATH}")
        } else {
            format!("https://{base}{ALLOCATIONS_PATH}")
        }
    }
}

/// Sends an allocation to another cluster and returns its terminal status.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn allocate(
        &self,
        target: &PeerTarget,
        request: &GameServerAllocation,
    ) -> Result<AllocationStatus, PeerError>;
}

/// Mutual-TLS HTTP client for peer allocation services.
pub struct HttpPeerClient {
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(dial_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            request_timeout,
        }
    }

    fn client_for(&self, target: &PeerTarget) -> Result<reqwest::Client, PeerError> {
        let credentials_error = |reason: String| PeerError::Credentials {
            cluster: target.cluster.clone(),
            reason,
        };

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(self.dial_timeout)
            .timeout(self.request_timeout);

        let secret_ca = target
            .credentials
            .as_ref()
            .and_then(|s| s.get("ca.crt"))
            .map(str::to_string);
        if let Some(ca) = target.server_ca.clone().or(secret_ca) {
            let cert = Certificate::from_pem(ca.as_bytes())
                .map_err(|e| credentials_error(format!("bad CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(secret) = &target.credentials {
            match (secret.get("tls.crt"), secret.get("tls.key")) {
                (Some(cert), Some(key)) => {
                    let pem = format!("{cert}\n{key}");
                    let identity = Identity::from_pem(pem.as_bytes())
                        .map_err(|e| credentials_error(format!("bad client certificate: {e}")))?;
                    builder = builder.identity(identity);
                }
                (None, None) => {}
                _ => {
                    return Err(credentials_error(
                        "secret needs both tls.crt and tls.key".to_string(),
                    ))
                }
            }
        }

        builder
            .build()
            .map_err(|e| credentials_error(format!("client setup failed: {e}")))
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn allocate(
        &self,
        target: &PeerTarget,
        request: &GameServerAllocation,
    ) -> Result<AllocationStatus, PeerError> {
        let client = self.client_for(target)?;
        let url = target.url();
        debug!(cluster = %target.cluster, url = %url, "Forwarding allocation");

        let response = client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| PeerError::Transport {
                endpoint: target.endpoint.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(cluster = %target.cluster, status = %status, body = %body, "Peer allocation failed");
            let endpoint = target.endpoint.clone();
            return Err(if status.is_server_error() {
                PeerError::Upstream {
                    endpoint,
                    status: status.as_u16(),
                    body,
                }
            } else {
                PeerError::Rejected {
                    endpoint,
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let allocation: GameServerAllocation =
            response.json().await.map_err(|e| PeerError::Protocol {
                endpoint: target.endpoint.clone(),
                reason: e.to_string(),
            })?;
        allocation.status.ok_or_else(|| PeerError::Protocol {
            endpoint: target.endpoint.clone(),
            reason: "reply carries no status".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_defaults_to_https() {
        let mut target = PeerTarget {
            cluster: "eu".into(),
            endpoint: "peer.example:8443/".into(),
            credentials: None,
            server_ca: None,
        };
        assert_eq!(target.url(), "https://peer.example:8443/v1/allocations");
        target.endpoint = "http://127.0.0.1:9000".into();
        assert_eq!(target.url(), "http://127.0.0.1:9000/v1/allocations");
    }

    #[test]
    fn test_half_a_key_pair_is_rejected() {
        let mut secret = Secret {
            metadata: Default::default(),
            data: Default::default(),
        };
        secret.data.insert("tls.crt".into(), "cert".into());
        let target = PeerTarget {
            cluster: "eu".into(),
            endpoint: "peer:443".into(),
            credentials: Some(secret),
            server_ca: None,
        };
        let client = HttpPeerClient::new(Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(
            client.client_for(&target),
            Err(PeerError::Credentials { .. })
        ));
    }

    #[test]
    fn test_retryable_classes() {
        let transport = PeerError::Transport {
            endpoint: "e".into(),
            reason: "refused".into(),
        };
        let rejected = PeerError::Rejected {
            endpoint: "e".into(),
            status: 422,
            body: String::new(),
        };
        assert!(transport.is_retryable());
        assert!(!rejected.is_retryable());
    }
}
