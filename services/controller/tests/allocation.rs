//! Allocation against converged fleets: single claims, races, and failover
//! to a peer cluster over HTTP.


use std::collections::BTreeSet;
use std::sync::Arc;

use fleetplane_api::{AllocationState, GameServerState, MetaPatch};
use fleetplane_controller::api::create_router;
use fleetplane_controller::config::Config;
use fleetplane_controller::state::AppState;
use harness::{request_for, Cluster};
use tokio::sync::watch;

#[tokio::test]
async fn test_single_allocation() {
    let cluster = Cluster::new();
    cluster.ready_fleet("f", 3).await;
    assert_eq!(cluster.count("f", GameServerState::Ready), 3);

    let mut request = request_for("f");
    request.spec.metadata = MetaPatch {
        labels: [("match".to_string(), "m-1".to_string())].into(),
        ..Default::default()
    };
    let allocation = cluster.allocate(request).await;
    let status = allocation.status.expect("status");
    assert_eq!(status.state, AllocationState::Allocated);
    assert_eq!(status.source, "local");
    assert!(!status.address.is_empty());
    assert_eq!(status.ports.len(), 1);

    let names: Vec<String> = cluster
        .members("f")
        .iter()
        .map(|gs| gs.metadata.name.clone())
        .collect();
    assert!(names.contains(&status.game_server_name));

    cluster.settle().await;
    let fleet = cluster.fleet("f");
    assert_eq!(fleet.status.ready_replicas, 2);
    assert_eq!(fleet.status.allocated_replicas, 1);

    let allocated = cluster
        .members("f")
        .into_iter()
        .find(|gs| gs.state() == GameServerState::Allocated)
        .expect("allocated server");
    assert_eq!(allocated.metadata.label("match"), Some("m-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_claim_each_server_once() {
    let cluster = Arc::new(Cluster::new());
    cluster.ready_fleet("f", 3).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let cluster = cluster.clone();
        tasks.push(tokio::spawn(async move {
            cluster.allocate(request_for("f")).await
        }));
    }

    let mut won = BTreeSet::new();
    let mut unallocated = 0;
    for task in tasks {
        let status = task.await.unwrap().status.expect("status");
        match status.state {
            AllocationState::Allocated => {
                assert!(won.insert(status.game_server_name), "server allocated twice");
            }
            AllocationState::UnAllocated => unallocated += 1,
            AllocationState::Contention => panic!("serialised claims should not contend"),
        }
    }
    assert_eq!(won.len(), 3);
    assert_eq!(unallocated, 7);
    assert_eq!(cluster.count("f", GameServerState::Allocated), 3);
}

#[tokio::test]
async fn test_allocated_server_is_not_reallocated_by_default() {
    let cluster = Cluster::new();
    cluster.ready_fleet("f", 1).await;

    let first = cluster.allocate(request_for("f")).await.status.unwrap();
    assert_eq!(first.state, AllocationState::Allocated);
    let second = cluster.allocate(request_for("f")).await.status.unwrap();
    assert_eq!(second.state, AllocationState::UnAllocated);

    // Asking for allocated servers explicitly re-allocates the running one.
    let mut again = request_for("f");
    again.spec.required.game_server_state = Some(GameServerState::Allocated);
    let third = cluster.allocate(again).await.status.unwrap();
    assert_eq!(third.state, AllocationState::Allocated);
    assert_eq!(third.game_server_name, first.game_server_name);
}

#[tokio::test]
async fn test_failover_to_peer_cluster() {
    // The peer: a second cluster serving the allocation API.
    let peer = Cluster::with_config(Config {
        cluster_name: "eu".to_string(),
        ..Config::default()
    });
    peer.ready_fleet("f", 2).await;
    let (_leading_tx, leading_rx) = watch::channel(true);
    let app = create_router(AppState::new(
        peer.ctx.clone(),
        peer.allocator.clone(),
        leading_rx,
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    // The local cluster has the fleet but nothing ready in it.
    let local = Cluster::new();
    local
        .store()
        .fleets
        .create(fleetplane_testing::fleet("f", 0))
        .unwrap();
    local
        .store()
        .allocation_policies
        .create(fleetplane_testing::allocation_policy("p1", "local", 1, 1, None))
        .unwrap();
    let endpoint = format!("http://{addr}");
    local
        .store()
        .allocation_policies
        .create(fleetplane_testing::allocation_policy(
            "p2",
            "eu",
            2,
            1,
            Some(endpoint.as_str()),
        ))
        .unwrap();

    let mut request = request_for("f");
    request.spec.multi_cluster.enabled = true;
    let status = local.allocate(request).await.status.expect("status");

    assert_eq!(status.state, AllocationState::Allocated);
    assert_eq!(status.source, "eu");
    assert_eq!(peer.count("f", GameServerState::Allocated), 1);
    let peer_names: Vec<String> = peer
        .members("f")
        .iter()
        .map(|gs| gs.metadata.name.clone())
        .collect();
    assert!(peer_names.contains(&status.game_server_name));
}
