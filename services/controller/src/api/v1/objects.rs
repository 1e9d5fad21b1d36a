//! Desired-state objects for standalone mode.
//!
//! `PUT` is an upsert: the body replaces the stored spec while the system
//! fields (uid, version, creation time, owner) and the status the
//! controllers own are carried over from the stored object.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use fleetplane_api::{AllocationPolicy, Fleet, FleetAutoscaler, Node, ObjectKey, Resource, Secret};
use tracing::info;

use crate::api::error::ApiError;
use crate::state::AppState;
use crate::store::Store;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/namespaces/{namespace}/fleets/{name}",
            get(get_fleet).put(put_fleet),
        )
        .route(
            "/namespaces/{namespace}/fleetautoscalers/{name}",
            put(put_autoscaler),
        )
        .route(
            "/namespaces/{namespace}/allocationpolicies/{name}",
            put(put_allocation_policy),
        )
        .route("/namespaces/{namespace}/secrets/{name}", put(put_secret))
        .route("/nodes/{name}", put(put_node))
}

// =============================================================================
// Apply
// =============================================================================

/// Upsert `obj` at `key`. `carry` copies controller-owned fields from the
/// stored object into the incoming one.
fn apply<T, F>(
    store: &Store<T>,
    key: ObjectKey,
    mut obj: T,
    carry: F,
) -> Result<(StatusCode, T), ApiError>
where
    T: Resource,
    F: Fn(&mut T, &T),
{
    let meta = obj.meta_mut();
    if !meta.name.is_empty() && meta.name != key.name {
        return Err(ApiError::bad_request(
            "name_mismatch",
            format!("body names {:?} but the path names {:?}", meta.name, key.name),
        ));
    }
    meta.name = key.name.clone();
    meta.namespace = key.namespace.clone();

    let Some(current) = store.get(&key) else {
        let created = store.create(obj)?;
        info!(kind = T::KIND, key = %key, "Created");
        return Ok((StatusCode::CREATED, created));
    };

    let previous = current.meta();
    let meta = obj.meta_mut();
    meta.resource_version = previous.resource_version;
    meta.owner = previous.owner.clone();
    carry(&mut obj, &current);

    // A write in between surfaces as 409; the client re-applies.
    let updated = store.update(obj)?;
    info!(kind = T::KIND, key = %key, "Updated");
    Ok((StatusCode::OK, updated))
}

fn unprocessable(reason: String) -> ApiError {
    ApiError::unprocessable("invalid_object", reason)
}

// =============================================================================
// Handlers
// =============================================================================

async fn get_fleet(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = ObjectKey::new(&namespace, &name);
    state
        .ctx()
        .store
        .fleets
        .get(&key)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("not_found", format!("Fleet {key} not found")))
}

async fn put_fleet(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(fleet): Json<Fleet>,
) -> Result<impl IntoResponse, ApiError> {
    fleet.spec.template.spec.validate().map_err(unprocessable)?;
    let key = ObjectKey::new(&namespace, &name);
    let (status, stored) = apply(&state.ctx().store.fleets, key, fleet, |new, old| {
        new.status = old.status.clone();
    })?;
    Ok((status, Json(stored)))
}

async fn put_autoscaler(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(autoscaler): Json<FleetAutoscaler>,
) -> Result<impl IntoResponse, ApiError> {
    autoscaler.spec.policy.validate().map_err(unprocessable)?;
    if autoscaler.spec.fleet_name.is_empty() {
        return Err(unprocessable("fleet_name is required".to_string()));
    }
    let key = ObjectKey::new(&namespace, &name);
    let store = &state.ctx().store.autoscalers;
    let (status, stored) = apply(store, key, autoscaler, |new, old| {
        new.status = old.status.clone();
    })?;
    Ok((status, Json(stored)))
}

async fn put_allocation_policy(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(policy): Json<AllocationPolicy>,
) -> Result<impl IntoResponse, ApiError> {
    if policy.spec.connection_info.cluster_name.is_empty() {
        return Err(unprocessable("connection_info.cluster_name is required".to_string()));
    }
    let key = ObjectKey::new(&namespace, &name);
    let store = &state.ctx().store.allocation_policies;
    let (status, stored) = apply(store, key, policy, |_, _| {})?;
    Ok((status, Json(stored)))
}

/// Peer credentials. The reply leaves out the data.
async fn put_secret(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(secret): Json<Secret>,
) -> Result<impl IntoResponse, ApiError> {
    let key = ObjectKey::new(&namespace, &name);
    let (status, mut stored) = apply(&state.ctx().store.secrets, key, secret, |_, _| {})?;
    stored.data.clear();
    Ok((status, Json(stored)))
}

/// Nodes are cluster scoped; the namespace is always empty.
async fn put_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(node): Json<Node>,
) -> Result<impl IntoResponse, ApiError> {
    let key = ObjectKey::new("", &name);
    let (status, stored) = apply(&state.ctx().store.nodes, key, node, |_, _| {})?;
    Ok((status, Json(stored)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header::CONTENT_TYPE, Method, Request};
    use fleetplane_testing::fleet;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::allocation::{Allocator, HttpPeerClient};
    use crate::api::create_router;
    use crate::context::{test_context, Context};

    use super::*;
    use crate::store::StoreError;

    fn app(ctx: Context) -> Router {
        let peers = Arc::new(HttpPeerClient::new(
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(1),
        ));
        let allocator = Arc::new(Allocator::new(ctx.clone(), peers));
        let (_tx, rx) = watch::channel(true);
        create_router(AppState::new(ctx, allocator, rx))
    }

    async fn send(app: Router, method: Method, uri: &str, body: String) -> StatusCode {
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
    }

    #[tokio::test]
    async fn test_put_fleet_creates_then_updates() {
        let ctx = test_context();
        let uri = "/v1/namespaces/default/fleets/f";
        let body = serde_json::to_string(&fleet("f", 3)).unwrap();

        let status = send(app(ctx.clone()), Method::PUT, uri, body.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        let key = ObjectKey::new("default", "f");
        let created = ctx.store.fleets.get(&key).unwrap();

        // Status written by the controllers survives an apply.
        ctx.store
            .fleets
            .mutate::<StoreError, _>(&key, |f| {
                f.status.ready_replicas = 2;
                Ok(true)
            })
            .unwrap();

        let mut scaled = fleet("f", 5);
        scaled.metadata.name = String::new();
        let body = serde_json::to_string(&scaled).unwrap();
        let status = send(app(ctx.clone()), Method::PUT, uri, body).await;
        assert_eq!(status, StatusCode::OK);

        let updated = ctx.store.fleets.get(&key).unwrap();
        assert_eq!(updated.metadata.uid, created.metadata.uid);
        assert_eq!(updated.spec.replicas, 5);
        assert_eq!(updated.status.ready_replicas, 2);
        assert_eq!(updated.metadata.generation, 2);

        let status = send(app(ctx), Method::GET, uri, String::new()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_put_fleet_rejects_bad_template() {
        let mut bad = fleet("f", 1);
        bad.spec.template.spec.container.image = String::new();
        let body = serde_json::to_string(&bad).unwrap();
        let status = send(
            app(test_context()),
            Method::PUT,
            "/v1/namespaces/default/fleets/f",
            body,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_put_with_mismatched_name_is_bad_request() {
        let body = serde_json::to_string(&fleet("other", 1)).unwrap();
        let status = send(
            app(test_context()),
            Method::PUT,
            "/v1/namespaces/default/fleets/f",
            body,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_fleet_is_not_found() {
        let status = send(
            app(test_context()),
            Method::GET,
            "/v1/namespaces/default/fleets/none",
            String::new(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_node_is_cluster_scoped() {
        let ctx = test_context();
        let body = serde_json::to_string(&fleetplane_testing::node("n1", "203.0.113.7")).unwrap();
        let status = send(app(ctx.clone()), Method::PUT, "/v1/nodes/n1", body).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(ctx.store.nodes.get(&ObjectKey::new("", "n1")).is_some());
    }
}
