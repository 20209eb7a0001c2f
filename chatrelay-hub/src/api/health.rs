//! `GET /health` — dependency-free liveness probe (§6).
//!
//! A tiny router with one route and a `Cache-Control: no-cache` response
//! header, so load balancers never cache a stale health result.

use axum::{
    Router,
    http::{HeaderValue, StatusCode, header},
    routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;

/// Builds the `/health` route.
pub(crate) fn routes() -> Router<crate::HubState> {
    Router::new().route("/health", get(health)).layer(
        SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ),
    )
}

async fn health() -> StatusCode {
    StatusCode::OK
}
