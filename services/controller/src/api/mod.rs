//! HTTP API handlers and routing.

pub mod error;
mod health;
mod v1;

use axum::{
    http::{HeaderValue, Request},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

pub use health::HealthResponse;

/// Assigns `req_…` ids to requests that arrive without `x-request-id`.
#[derive(Debug, Clone, Copy, Default)]
struct MakePrefixedRequestId;

impl MakeRequestId for MakePrefixedRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = fleetplane_id::RequestId::new().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Create the API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakePrefixedRequestId))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id());

    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(middleware)
        .with_state(state)
}
