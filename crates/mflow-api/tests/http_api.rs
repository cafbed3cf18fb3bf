//! HTTP surface over the in-memory store and channel.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tower::ServiceExt;

use mflow_api::{create_router, ApiConfig, AppState};
use mflow_models::{Pipeline, WorkerKind};
use mflow_orchestrator::{Orchestrator, OrchestratorConfig};
use mflow_queue::{Channel, InMemoryChannel, TaskFailedEvent};
use mflow_store::{InMemoryJobStore, JobStore};

struct TestApp {
    router: Router,
    store: Arc<InMemoryJobStore>,
    channel: Arc<InMemoryChannel>,
    orchestrator: Arc<Orchestrator>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(ApiConfig::default(), false)
    }

    fn with_config(config: ApiConfig, metrics: bool) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            channel.clone(),
            Arc::new(Pipeline::from_kinds([WorkerKind::Thumbnail, WorkerKind::Transcode]).unwrap()),
            &OrchestratorConfig::default(),
        ));
        let state = AppState::new(config, orchestrator.clone(), store.clone(), channel.clone());
        let handle = metrics.then(|| PrometheusBuilder::new().build_recorder().handle());

        Self {
            router: create_router(state, handle),
            store,
            channel,
            orchestrator,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        (status, body)
    }
}

#[tokio::test]
async fn test_create_job_returns_201_and_dispatches() {
    let app = TestApp::new();

    let (status, body) = app
        .post_json("/jobs", json!({"mediaId": "m1", "sourceUrl": "s3://in/m1.mp4"}))
        .await;

    assert_eq!(status, StatusCode::CREATED);
    let job_id = body["jobId"].as_str().unwrap();
    let job = app.store.get_job_by_media_id("m1").await.unwrap().unwrap();
    assert_eq!(job.id.as_str(), job_id);
    assert_eq!(app.channel.published_on(Channel::Tasks(WorkerKind::Thumbnail)).len(), 1);
}

#[tokio::test]
async fn test_create_job_missing_field_is_400() {
    let app = TestApp::new();

    let (status, body) = app.post_json("/jobs", json!({"mediaId": "m1"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("source"));
    assert!(app.store.is_empty().await);
    assert_eq!(app.channel.published_count(), 0);
}

#[tokio::test]
async fn test_create_job_blank_field_is_400() {
    let app = TestApp::new();

    let (status, body) = app
        .post_json("/jobs", json!({"mediaId": "  ", "sourceUrl": "s3://in/m1.mp4"}))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].is_string());
    assert_eq!(app.channel.published_count(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_400_with_detail() {
    let app = TestApp::new();

    let (status, _, body) = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn test_retry_unknown_media_is_404() {
    let app = TestApp::new();

    let (status, body) = app.post_json("/jobs/nope/retry", json!({})).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_retry_failed_job_redispatches() {
    let app = TestApp::new();
    app.post_json("/jobs", json!({"mediaId": "m1", "sourceUrl": "s3://in/m1.mp4"}))
        .await;
    let job = app.store.get_job_by_media_id("m1").await.unwrap().unwrap();
    app.orchestrator
        .handle_task_failed(TaskFailedEvent {
            job_id: job.id.clone(),
            task_id: job.tasks[0].id.clone(),
            error: Some("decoder crashed".into()),
        })
        .await
        .unwrap();
    app.channel.clear_published();

    let (status, body) = app.post_json("/jobs/m1/retry", json!({})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"jobId": job.id.as_str(), "status": "pending"}));
    assert_eq!(app.channel.published_on(Channel::Tasks(WorkerKind::Thumbnail)).len(), 1);
}

#[tokio::test]
async fn test_retry_of_pending_job_changes_nothing() {
    let app = TestApp::new();
    app.post_json("/jobs", json!({"mediaId": "m1", "sourceUrl": "s3://in/m1.mp4"}))
        .await;
    app.channel.clear_published();

    let (status, body) = app.post_json("/jobs/m1/retry", json!({})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(app.channel.published_count(), 0);
}

#[tokio::test]
async fn test_get_job_view() {
    let app = TestApp::new();
    app.post_json("/jobs", json!({"mediaId": "m1", "sourceUrl": "s3://in/m1.mp4"}))
        .await;

    let (status, _, body) = app.get("/jobs/m1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mediaId"], "m1");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["tasks"][0]["workerKind"], "thumbnail");
    assert_eq!(body["tasks"][0]["progress"], 0);

    let (status, _, body) = app.get("/jobs/other").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn test_health_and_readiness() {
    let app = TestApp::new();

    for uri in ["/health", "/healthz"] {
        let (status, _, body) = app.get(uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    let (status, _, body) = app.get("/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["store"]["status"], "ok");
    assert_eq!(body["checks"]["broker"]["status"], "ok");
}

#[tokio::test]
async fn test_metrics_route_follows_config() {
    let app = TestApp::new();
    let (status, _, _) = app.get("/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let app = TestApp::with_config(ApiConfig::default(), true);
    let (status, _, _) = app.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_response_headers() {
    let app = TestApp::new();

    let (_, headers, _) = app
        .send(
            Request::builder()
                .uri("/health")
                .header("X-Request-ID", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(headers["x-request-id"], "req-123");
    assert_eq!(headers["x-content-type-options"], "nosniff");

    let (_, headers, _) = app.get("/health").await;
    assert!(!headers["x-request-id"].is_empty());
}

#[tokio::test]
async fn test_rate_limit_per_client() {
    let config = ApiConfig {
        rate_limit_rps: 1,
        rate_limit_burst: 1,
        ..ApiConfig::default()
    };
    let app = TestApp::with_config(config, false);
    let request = |ip: &str| {
        Request::builder()
            .uri("/jobs/m1")
            .header("X-Forwarded-For", ip)
            .body(Body::empty())
            .unwrap()
    };

    let (status, _, _) = app.send(request("203.0.113.7")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, headers, body) = app.send(request("203.0.113.7")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[header::RETRY_AFTER], "1");
    assert_eq!(body["detail"], "Rate limited");

    let (status, _, _) = app.send(request("203.0.113.8")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
