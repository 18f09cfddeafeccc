//! Pull-based metrics endpoint.

use crate::output::collector;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::Registry;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Content type of the Prometheus text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Build the router serving `/metrics` and `/health`.
///
/// Requests are logged at `DEBUG` level through [`TraceLayer`].
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn metrics(State(registry): State<Registry>) -> Response {
    match collector::render(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response(),
        Err(error) => {
            tracing::error!(%error, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// Bind `addr` and serve until the listener fails.
pub async fn serve(addr: SocketAddr, registry: Registry) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "serving metrics");
    axum::serve(listener, router(registry)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::AliasMap;
    use crate::store::{DEFAULT_STALE_AFTER, DeviceStateStore};
    use crate::test_utils::{TEST_MAC, uniform_meter};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Instant;
    use tower::ServiceExt;

    fn app(store: Arc<DeviceStateStore>) -> Router {
        let registry = collector::registry(store, DEFAULT_STALE_AFTER, AliasMap::new()).unwrap();
        router(registry)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_live_devices() {
        let store = Arc::new(DeviceStateStore::new());
        store.upsert(TEST_MAC, uniform_meter(21.5), Instant::now());

        let (status, content_type, body) = get_body(app(store), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(TEXT_CONTENT_TYPE));
        assert!(body.contains(r#"switchbot_temperature{hw="AA:BB:CC:DD:EE:FF",name=""} 21.5"#));
    }

    #[tokio::test]
    async fn metrics_endpoint_reflects_later_updates() {
        let store = Arc::new(DeviceStateStore::new());
        let app = app(Arc::clone(&store));

        let (_, _, body) = get_body(app.clone(), "/metrics").await;
        assert!(body.is_empty());

        store.upsert(TEST_MAC, uniform_meter(64.0), Instant::now());
        let (_, _, body) = get_body(app, "/metrics").await;
        assert!(body.contains(r#"switchbot_battery{hw="AA:BB:CC:DD:EE:FF",name=""} 64"#));
    }

    #[tokio::test]
    async fn health_endpoint() {
        let store = Arc::new(DeviceStateStore::new());
        let (status, _, body) = get_body(app(store), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let store = Arc::new(DeviceStateStore::new());
        let (status, _, _) = get_body(app(store), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
