//! Fleet autoscaling end to end: buffer policy against a live fleet and a
//! webhook policy against a mock endpoint.


use fleetplane_api::{
    AutoscalerPolicy, FleetAutoscaleResponse, FleetAutoscaleReview, FleetAutoscaler,
    FleetAutoscalerSpec, GameServerState, IntOrPercent, ObjectKey, ObjectMeta, WebhookPolicy,
};
use harness::{request_for, Cluster};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn autoscaler_key(fleet: &str) -> ObjectKey {
    ObjectKey::new(fleetplane_testing::NAMESPACE, format!("{fleet}-autoscaler"))
}

#[tokio::test]
async fn test_buffer_keeps_five_spare_above_allocated() {
    let cluster = Cluster::new();
    cluster.ready_fleet("f", 7).await;
    for _ in 0..4 {
        cluster.allocate(request_for("f")).await;
    }
    cluster.settle().await;
    let fleet = cluster.fleet("f");
    assert_eq!(fleet.status.allocated_replicas, 4);
    assert_eq!(fleet.status.ready_replicas, 3);

    cluster
        .store()
        .autoscalers
        .create(fleetplane_testing::buffer_autoscaler(
            "f",
            IntOrPercent::Int(5),
            1,
            20,
        ))
        .unwrap();
    cluster.evaluate_autoscalers().await;
    assert_eq!(cluster.fleet("f").spec.replicas, 9);

    cluster.converge().await;
    assert_eq!(cluster.members("f").len(), 9);
    assert_eq!(cluster.count("f", GameServerState::Ready), 5);

    let status = cluster
        .store()
        .autoscalers
        .get(&autoscaler_key("f"))
        .unwrap()
        .status;
    assert!(status.able_to_scale);
    assert_eq!(status.desired_replicas, 9);
    assert_eq!(status.last_applied_policy.as_deref(), Some("Buffer"));

    // Already satisfied: a second evaluation leaves the fleet alone.
    let before = cluster.fleet("f").metadata.resource_version;
    cluster.evaluate_autoscalers().await;
    let after = cluster.fleet("f");
    assert_eq!(after.spec.replicas, 9);
    assert_eq!(after.metadata.resource_version, before);
}

#[tokio::test]
async fn test_buffer_percentage_caps_at_max() {
    let cluster = Cluster::new();
    cluster.ready_fleet("f", 4).await;
    for _ in 0..4 {
        cluster.allocate(request_for("f")).await;
    }
    cluster.settle().await;

    cluster
        .store()
        .autoscalers
        .create(fleetplane_testing::buffer_autoscaler(
            "f",
            IntOrPercent::Percent(50),
            1,
            5,
        ))
        .unwrap();
    cluster.evaluate_autoscalers().await;

    // 4 allocated + 50% would be 6; max is 5.
    assert_eq!(cluster.fleet("f").spec.replicas, 5);
    let status = cluster
        .store()
        .autoscalers
        .get(&autoscaler_key("f"))
        .unwrap()
        .status;
    assert!(status.scaling_limited);
}

/// Answers every review with `replicas = ready + 2`, echoing the uid.
struct TwoMore;

impl Respond for TwoMore {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let review: FleetAutoscaleReview = serde_json::from_slice(&request.body).unwrap();
        let asked = review.request.unwrap();
        ResponseTemplate::new(200).set_body_json(FleetAutoscaleReview {
            request: None,
            response: Some(FleetAutoscaleResponse {
                uid: asked.uid,
                scale: true,
                replicas: asked.status.ready_replicas + 2,
            }),
        })
    }
}

#[tokio::test]
async fn test_webhook_decides_replicas() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scale"))
        .respond_with(TwoMore)
        .expect(1)
        .mount(&server)
        .await;

    let cluster = Cluster::new();
    cluster.ready_fleet("f", 3).await;
    cluster
        .store()
        .autoscalers
        .create(FleetAutoscaler {
            metadata: ObjectMeta::named(fleetplane_testing::NAMESPACE, "f-autoscaler"),
            spec: FleetAutoscalerSpec {
                fleet_name: "f".to_string(),
                policy: AutoscalerPolicy::Webhook(WebhookPolicy {
                    url: format!("{}/scale", server.uri()),
                    ca_bundle: None,
                    min_replicas: None,
                    max_replicas: Some(10),
                }),
                sync: None,
            },
            status: Default::default(),
        })
        .unwrap();

    cluster.evaluate_autoscalers().await;
    assert_eq!(cluster.fleet("f").spec.replicas, 5);
    cluster.converge().await;
    assert_eq!(cluster.count("f", GameServerState::Ready), 5);
}
