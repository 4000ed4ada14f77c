//! Handler registration.
//!
//! The listener layer treats the router as opaque: it hands the current
//! [`ServerConfigSnapshot`] to a registration callback and serves whatever
//! comes back. [`default_handlers`] is the callback the binary uses.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfigSnapshot;

/// Builds the router for one listener generation.
pub type RegisterHandlers = dyn Fn(&ServerConfigSnapshot) -> Router + Send + Sync;

/// Routes registered by [`default_handlers`], as `(method, path)`.
pub const ROUTES: &[(&str, &str)] = &[
    ("GET", "/livez"),
    ("GET", "/readyz"),
    ("GET", "/v1/general/status"),
];

#[derive(Clone)]
struct HandlerState {
    production: bool,
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub production: bool,
}

/// Health probes and the status endpoint, with request ids and tracing.
pub fn default_handlers(snapshot: &ServerConfigSnapshot) -> Router {
    if snapshot.production {
        tracing::info!("Production mode enabled");
    } else {
        tracing::info!("Non-production setup, authentication disabled");
    }

    let state = HandlerState {
        production: snapshot.production,
    };

    Router::new()
        .route("/livez", get(probe))
        .route("/readyz", get(probe))
        .route("/v1/general/status", get(get_status))
        .fallback(not_found)
        .with_state(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn probe() -> StatusCode {
    StatusCode::OK
}

async fn get_status(State(state): State<HandlerState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        production: state.production,
    })
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn every_listed_route_is_served() {
        let snapshot = ServerConfigSnapshot::plaintext("127.0.0.1", 0);
        for (method, path) in ROUTES {
            let request = Request::builder()
                .method(*method)
                .uri(*path)
                .body(Body::empty())
                .unwrap();
            let response = default_handlers(&snapshot).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{method} {path}");
            assert!(response.headers().contains_key("x-request-id"));
        }
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let snapshot = ServerConfigSnapshot::plaintext("127.0.0.1", 0);
        let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let response = default_handlers(&snapshot).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_production_flag() {
        let mut snapshot = ServerConfigSnapshot::plaintext("127.0.0.1", 0);
        snapshot.production = true;
        let request = Request::builder()
            .uri("/v1/general/status")
            .body(Body::empty())
            .unwrap();

        let response = default_handlers(&snapshot).oneshot(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["production"], true);
    }
}
