//! Allocation endpoint.
//!
//! Matchmakers and peer clusters post a `GameServerAllocation` and get it
//! back with a terminal status. Finding nothing or losing every race is a
//! normal answer, not an error.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use fleetplane_api::{AllocationState, GameServerAllocation};
use tracing::instrument;

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(allocate))
}

#[instrument(skip_all, fields(namespace = %request.metadata.namespace))]
async fn allocate(
    State(state): State<AppState>,
    Json(request): Json<GameServerAllocation>,
) -> Result<impl IntoResponse, ApiError> {
    let allocation = state.allocator().allocate(request).await?;
    let status = match allocation.status.as_ref().map(|s| s.state) {
        Some(AllocationState::Allocated) => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(allocation)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header::CONTENT_TYPE, Request};
    use fleetplane_testing::GameServerBuilder;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::allocation::{Allocator, HttpPeerClient};
    use crate::api::create_router;
    use crate::context::test_context;
    use crate::state::AppState;

    use super::*;

    fn app(ctx: crate::context::Context) -> Router {
        let peers = Arc::new(HttpPeerClient::new(
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(1),
        ));
        let allocator = Arc::new(Allocator::new(ctx.clone(), peers));
        let (_tx, rx) = watch::channel(true);
        create_router(AppState::new(ctx, allocator, rx))
    }

    async fn post_allocation(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::post("/v1/allocations")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_allocated_is_created() {
        let ctx = test_context();
        ctx.store
            .game_servers
            .create(
                GameServerBuilder::new("gs-1")
                    .ready_on("node-a")
                    .build(),
            )
            .unwrap();

        let (status, body) = post_allocation(
            app(ctx),
            r#"{"metadata":{"name":"","namespace":"default"},"spec":{}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"]["state"], "Allocated");
        assert_eq!(body["status"]["game_server_name"], "gs-1");
    }

    #[tokio::test]
    async fn test_nothing_ready_is_ok_unallocated() {
        let (status, body) = post_allocation(
            app(test_context()),
            r#"{"metadata":{"name":"","namespace":"default"},"spec":{}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["state"], "UnAllocated");
    }

    #[tokio::test]
    async fn test_multi_cluster_without_policies_is_unprocessable() {
        let (status, body) = post_allocation(
            app(test_context()),
            r#"{"metadata":{"name":"","namespace":"default"},
                "spec":{"multi_cluster":{"enabled":true}}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "allocation_rejected");
    }
}
