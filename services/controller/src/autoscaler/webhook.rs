//! Client for webhook autoscaling policies.

use std::time::Duration;

use fleetplane_api::{
    Fleet, FleetAutoscaleRequest, FleetAutoscaleResponse, FleetAutoscaleReview, WebhookPolicy,
};
use fleetplane_id::RequestId;
use reqwest::Certificate;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook {url} unreachable: {reason}")]
    Transport { url: String, reason: String },

    #[error("webhook {url} answered {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("webhook {url} sent an invalid review: {reason}")]
    Protocol { url: String, reason: String },

    #[error("invalid CA bundle: {0}")]
    CaBundle(String),
}

/// Posts a [`FleetAutoscaleReview`] to the policy endpoint and returns the
/// answer.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    timeout: Duration,
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client_for(&self, policy: &WebhookPolicy) -> Result<reqwest::Client, WebhookError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(self.timeout);
        if let Some(bundle) = &policy.ca_bundle {
            let cert = Certificate::from_pem(bundle.as_bytes())
                .map_err(|e| WebhookError::CaBundle(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| WebhookError::CaBundle(e.to_string()))
    }

    pub async fn review(
        &self,
        policy: &WebhookPolicy,
        fleet: &Fleet,
    ) -> Result<FleetAutoscaleResponse, WebhookError> {
        let client = self.client_for(policy)?;
        let uid = RequestId::new().to_string();
        let review = FleetAutoscaleReview {
            request: Some(FleetAutoscaleRequest {
                uid: uid.clone(),
                name: fleet.metadata.name.clone(),
                namespace: fleet.metadata.namespace.clone(),
                status: fleet.status.clone(),
            }),
            response: None,
        };
        let url = policy.url.clone();
        debug!(url = %url, uid = %uid, "Sending autoscale review");

        let response = client
            .post(&url)
            .json(&review)
            .send()
            .await
            .map_err(|e| WebhookError::Transport {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, "Autoscale webhook failed");
            return Err(WebhookError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let answer: FleetAutoscaleReview =
            response.json().await.map_err(|e| WebhookError::Protocol {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let Some(response) = answer.response else {
            return Err(WebhookError::Protocol {
                url,
                reason: "review carries no response".to_string(),
            });
        };
        if response.uid != uid {
            return Err(WebhookError::Protocol {
                url,
                reason: format!("response uid {} does not match {uid}", response.uid),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetplane_testing::fleet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Echoes the request uid back with a fixed decision.
    struct Decide(u32);

    impl Respond for Decide {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let review: FleetAutoscaleReview = serde_json::from_slice(&request.body).unwrap();
            let uid = review.request.unwrap().uid;
            ResponseTemplate::new(200).set_body_json(FleetAutoscaleReview {
                request: None,
                response: Some(FleetAutoscaleResponse {
                    uid,
                    scale: true,
                    replicas: self.0,
                }),
            })
        }
    }

    fn policy(url: String) -> WebhookPolicy {
        WebhookPolicy {
            url,
            ca_bundle: None,
            min_replicas: None,
            max_replicas: None,
        }
    }

    #[tokio::test]
    async fn test_review_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scale"))
            .respond_with(Decide(7))
            .mount(&server)
            .await;

        let client = WebhookClient::new(Duration::from_secs(2));
        let answer = client
            .review(&policy(format!("{}/scale", server.uri())), &fleet("f", 3))
            .await
            .unwrap();
        assert!(answer.scale);
        assert_eq!(answer.replicas, 7);
    }

    #[tokio::test]
    async fn test_mismatched_uid_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(FleetAutoscaleReview {
                request: None,
                response: Some(FleetAutoscaleResponse {
                    uid: "someone-else".into(),
                    scale: true,
                    replicas: 1,
                }),
            }))
            .mount(&server)
            .await;

        let client = WebhookClient::new(Duration::from_secs(2));
        let err = client
            .review(&policy(server.uri()), &fleet("f", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = WebhookClient::new(Duration::from_secs(2));
        let err = client
            .review(&policy(server.uri()), &fleet("f", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Status { status: 503, .. }));
    }
}
