//! API v1 routes.

mod allocations;
mod objects;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/allocations", allocations::routes())
        .merge(objects::routes())
}
