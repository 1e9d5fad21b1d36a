//! Liveness and readiness probes.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok", or "standby" when another process leads.
    pub status: String,
    pub service: String,
    pub version: String,
    pub leading: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Ready only while this process holds leadership.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let leading = state.is_leading();
    let response = HealthResponse {
        status: if leading { "ok" } else { "standby" }.to_string(),
        service: "controller".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leading,
    };
    if leading {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
