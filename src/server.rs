use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, middleware, routing::get};
use partner_gateway::{
    ActivityLogger, ApiKeyVerifier, ForwardError, ProxyRoute, ReverseProxyForwarder,
    record_activity, register_proxy_routes,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{error, info};

async fn health_check() -> &'static str {
    "ok"
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "OK!" }))
}

/// Health routes plus every proxy route, wrapped in the activity logger when
/// one is given.
pub fn build_router(
    routes: Vec<ProxyRoute>,
    forwarder: ReverseProxyForwarder,
    verifier: Option<Arc<dyn ApiKeyVerifier>>,
    activity: Option<ActivityLogger>,
) -> Result<Router, ForwardError> {
    let router = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check));
    let mut router = register_proxy_routes(router, routes, forwarder, verifier)?;

    if let Some(logger) = activity {
        router = router.layer(middleware::from_fn_with_state(logger, record_activity));
    }
    Ok(router)
}

/// Serves `router` until ctrl-c (or SIGTERM on unix), then waits for open
/// connections to finish.
pub async fn serve(addr: SocketAddr, router: Router) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "partner gateway listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received; draining connections");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use partner_gateway::{
        Environment, SqliteStore, WriteQueue, auth::AuthRejection, forwarder::BODY_LIMIT,
    };
    use tower::ServiceExt;

    use super::*;

    struct AllowAll;

    #[async_trait::async_trait]
    impl ApiKeyVerifier for AllowAll {
        async fn verify(&self, _headers: &axum::http::HeaderMap) -> Result<(), AuthRejection> {
            Ok(())
        }
    }

    fn forwarder() -> ReverseProxyForwarder {
        ReverseProxyForwarder::new(Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn root_and_health_routes() {
        let router = build_router(Vec::new(), forwarder(), None, None).unwrap();

        let response = router
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
        assert_eq!(&bytes[..], br#"{"message":"OK!"}"#);

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = body::to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn protected_route_requires_a_verifier() {
        let route = ProxyRoute::new("http://127.0.0.1:9", "/partner").unwrap();
        let result = build_router(vec![route.clone()], forwarder(), None, None);
        assert!(matches!(result, Err(ForwardError::MissingVerifier(_))));

        let verifier: Arc<dyn ApiKeyVerifier> = Arc::new(AllowAll);
        assert!(build_router(vec![route], forwarder(), Some(verifier), None).is_ok());
    }

    #[test]
    fn overlapping_route_config_fails_without_panicking() {
        let routes = vec![
            ProxyRoute::new("http://127.0.0.1:9", "/partner")
                .unwrap()
                .require_auth(false),
            ProxyRoute::new("http://127.0.0.1:10", "/partner/")
                .unwrap()
                .require_auth(false),
        ];
        let result = build_router(routes, forwarder(), None, None);
        assert!(matches!(result, Err(ForwardError::DuplicatePrefix { .. })));
    }

    #[tokio::test]
    async fn requests_are_recorded_in_the_activity_log() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let queue = WriteQueue::start();
        let logger =
            ActivityLogger::new(queue.handle(), Arc::new(store.clone()), Environment::Local);
        let router = build_router(Vec::new(), forwarder(), None, Some(logger)).unwrap();

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        queue.shutdown().await;
        let recent = store.recent_activity(5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].route, "/health");
        assert_eq!(recent[0].method, "GET");
        assert_eq!(recent[0].response, "OK");
    }
}
