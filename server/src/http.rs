//! HTTP surface

use crate::error::HarvestError;
use crate::harvest::{cookie_for, error_response, issue_cookie, Harvester};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    routing::{get, post},
    Json, Router,
};
use shared::{Request, Response, HARVEST_PATH};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Shared across handlers; read-only after startup
pub struct AppState {
    pub harvester: Arc<Harvester>,
    pub request_timeout: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(HARVEST_PATH, post(harvest))
        .with_state(state)
}

/// Serve until `shutdown` resolves, recording each peer address
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health_check() -> &'static str {
    "OK"
}

/// Errors are always reported in the body, never as an HTTP status
async fn harvest(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Json<Response> {
    let mut request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = HarvestError::Protocol(format!("malformed request: {}", e));
            warn!(error = %err, "Rejected harvest request");
            return Json(error_response(issue_cookie().unwrap_or_default(), &err));
        }
    };

    // Settle the cookie up front so timeouts and panics still carry it
    let cookie = match cookie_for(&request) {
        Ok(cookie) => cookie,
        Err(e) => return Json(error_response(String::new(), &e)),
    };
    request.server_cookie = Some(cookie.clone());

    let peer = connect.map(|ConnectInfo(addr)| addr.ip());
    let harvester = state.harvester.clone();

    // Signing and file reads are blocking; keep them off the reactor
    let round = tokio::task::spawn_blocking(move || harvester.run(&request, peer));

    match tokio::time::timeout(state.request_timeout, round).await {
        Ok(Ok(response)) => Json(response),
        Ok(Err(e)) => {
            error!(error = %e, "Harvest task panicked");
            Json(error_response(
                cookie,
                &HarvestError::Internal("harvest task failed".to_string()),
            ))
        }
        Err(_) => {
            let err = HarvestError::Timeout(state.request_timeout);
            warn!(error = %err, "Harvest timed out");
            Json(error_response(cookie, &err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backends;
    use crate::error::ProducerError;
    use crate::harvest::{Limits, Policy};
    use crate::producer::{Context, Producer};
    use crate::{Config, Registry};
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use shared::task::{Task, TaskCodec, TaskKey};
    use shared::{MachineInfo, Product, PROTOCOL_VERSION};
    use tower::ServiceExt;

    fn app(harvester: Harvester, request_timeout: Duration) -> Router {
        router(Arc::new(AppState {
            harvester: Arc::new(harvester),
            request_timeout,
        }))
    }

    fn file_app() -> Router {
        let config = Config::from_yaml(
            "policies: [{name: p, produce: [{name: hostname, type: file, content: '${req.fqdn}'}]}]",
        )
        .unwrap();
        let harvester = Harvester::from_config(&config, &Registry::standard()).unwrap();
        app(harvester, Duration::from_secs(5))
    }

    fn post(body: impl Into<Body>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(HARVEST_PATH)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn call(app: Router, req: HttpRequest<Body>) -> Response {
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request_json(fqdn: &str) -> Vec<u8> {
        request_with_cookie(fqdn, Some("c00k1e"))
    }

    fn request_with_cookie(fqdn: &str, cookie: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&Request {
            client_version: PROTOCOL_VERSION,
            server_cookie: cookie.map(str::to_string),
            machine: MachineInfo {
                fqdn: fqdn.to_string(),
                ..Default::default()
            },
            task_responses: Vec::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn health() {
        let res = file_app()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn harvest_returns_products() {
        let response = call(file_app(), post(request_json("node-4.example.net"))).await;
        assert!(response.errors.is_empty());
        assert_eq!(response.server_cookie, "c00k1e");
        assert_eq!(
            response.products,
            vec![Product {
                name: vec!["hostname".to_string()],
                mask: 0o400,
                body: b"node-4.example.net".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn malformed_body_is_a_protocol_error() {
        let response = call(file_app(), post("{\"client_version\": 0}")).await;
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].kind, "protocol");
        assert!(response.products.is_empty());

        let response = call(file_app(), post("not json")).await;
        assert_eq!(response.errors[0].kind, "protocol");
        assert_eq!(response.server_cookie.len(), 32);
    }

    struct Sluggish;

    impl Producer for Sluggish {
        fn name(&self) -> &str {
            "sluggish"
        }

        fn kind(&self) -> &'static str {
            "test"
        }

        fn prepare(&self, _: &Context<'_>) -> Result<Vec<(TaskKey, Task)>, ProducerError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Vec::new())
        }

        fn produce(&self, _: &Context<'_>) -> Result<Vec<Product>, ProducerError> {
            Ok(vec![Product {
                name: vec!["late".to_string()],
                mask: 0o400,
                body: Vec::new(),
            }])
        }
    }

    fn sluggish_harvester() -> Harvester {
        let policy = Policy::new("slow", Vec::new(), vec![Box::new(Sluggish)]).unwrap();
        Harvester::new(
            vec![policy],
            Backends::new(),
            TaskCodec::standard(),
            Limits::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn slow_round_times_out_without_products() {
        let response = call(
            app(sluggish_harvester(), Duration::from_millis(20)),
            post(request_json("a")),
        )
        .await;
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].kind, "timeout");
        assert_eq!(response.server_cookie, "c00k1e");
        assert!(response.products.is_empty());

        let response = call(
            app(sluggish_harvester(), Duration::from_millis(20)),
            post(request_with_cookie("a", None)),
        )
        .await;
        assert_eq!(response.errors[0].kind, "timeout");
        assert_eq!(response.server_cookie.len(), 32);
        assert!(response.server_cookie.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn issued_cookie_is_kept_for_the_round() {
        let response = call(file_app(), post(request_with_cookie("node-4", None))).await;
        assert!(response.errors.is_empty());
        assert_eq!(response.server_cookie.len(), 32);
    }
}
