//! HTTP endpoints of the worker host.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::host::WorkerHost;
use crate::control::protocol::{ActivateRequest, ActivateResponse};

/// GET /health
async fn health(State(host): State<Arc<WorkerHost>>) -> impl IntoResponse {
    Json(host.health().await)
}

/// POST /activate
///
/// An empty body means "all defaults". Invalid JSON is a 400.
async fn activate(State(host): State<Arc<WorkerHost>>, body: Bytes) -> impl IntoResponse {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        ActivateRequest::default()
    } else {
        match serde_json::from_slice::<ActivateRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ActivateResponse {
                        success: false,
                        error: Some(format!("invalid activate request: {e}")),
                        ..Default::default()
                    }),
                );
            }
        }
    };

    info!(interval = req.interval, "Activation request received");
    (StatusCode::OK, Json(host.activate(req).await))
}

/// POST /deactivate
async fn deactivate(State(host): State<Arc<WorkerHost>>) -> impl IntoResponse {
    info!("Deactivation request received");
    Json(host.deactivate().await)
}

/// GET /status
async fn status(State(host): State<Arc<WorkerHost>>) -> impl IntoResponse {
    let status = host.status().await;
    let code = if status.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(status))
}

/// Build the worker control routes.
pub fn worker_routes(host: Arc<WorkerHost>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/activate", post(activate))
        .route("/deactivate", post(deactivate))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::WorkerHostConfig;
    use crate::store::LibSqlBackend;
    use crate::worker::HandlerRegistry;

    async fn app() -> (Router, Arc<WorkerHost>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let host = Arc::new(WorkerHost::new(
            WorkerHostConfig::default(),
            db,
            HandlerRegistry::with_builtin(),
        ));
        (worker_routes(Arc::clone(&host)), host)
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = app().await;
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["processor_running"], false);
    }

    #[tokio::test]
    async fn activate_with_empty_body_uses_defaults() {
        let (app, host) = app().await;
        let resp = app
            .oneshot(Request::post("/activate").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["auto_stop_minutes"], 30);
        assert_eq!(body["details"]["interval"], 5);
        host.deactivate().await;
    }

    #[tokio::test]
    async fn activate_with_bad_json_is_400() {
        let (app, host) = app().await;
        let resp = app
            .oneshot(
                Request::post("/activate")
                    .header("content-type", "application/json")
                    .body(Body::from("{interval:"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert!(!host.is_running().await);
    }

    #[tokio::test]
    async fn deactivate_when_stopped_reports_failure() {
        let (app, _) = app().await;
        let resp = app
            .oneshot(Request::post("/deactivate").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["success"], false);
    }

    #[tokio::test]
    async fn status_lists_all_statuses() {
        let (app, _) = app().await;
        let resp = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        for key in ["PENDING", "RUNNING", "COMPLETED", "FAILED"] {
            assert_eq!(body["job_stats"][key], 0, "{key}");
        }
    }
}
