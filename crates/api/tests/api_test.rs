use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use scheduler_api::create_app;
use scheduler_core::config::{ApiConfig, DispatcherConfig, SchedulerTuning, TuningHandle};
use scheduler_dispatcher::DispatcherComponents;
use scheduler_domain::entities::TaskStatus;
use scheduler_domain::repositories::{TaskQuery, TaskStore};
use scheduler_infrastructure::{InMemoryFilterRepository, InMemoryMetaStore, InMemoryTaskStore, MetricsCollector};
use scheduler_testing_utils::MetaRecordBuilder;

struct TestApp {
    router: Router,
    metas: Arc<InMemoryMetaStore>,
    tasks: Arc<InMemoryTaskStore>,
}

fn test_app() -> TestApp {
    let metas = Arc::new(InMemoryMetaStore::new());
    let tasks = Arc::new(InMemoryTaskStore::new());
    let dispatcher = DispatcherComponents::build(
        Arc::new(InMemoryFilterRepository::new()),
        metas.clone(),
        tasks.clone(),
        TuningHandle::new(SchedulerTuning::default()),
        Arc::new(MetricsCollector::new().unwrap()),
        &DispatcherConfig::default(),
    );
    let router = create_app(dispatcher, None, CancellationToken::new(), &ApiConfig::default());
    TestApp {
        router,
        metas,
        tasks,
    }
}

impl TestApp {
    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-scheduler-user", "alice");
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn create_raw_events_filter(&self) -> i64 {
        let (status, body) = self
            .call(
                "POST",
                "/api/filters",
                Some(json!({
                    "name": "raw events",
                    "processor_kind": "noop",
                    "priority": 5,
                    "expression": {
                        "op": "AND",
                        "children": [
                            { "type": "term", "field": "Type", "condition": "EQUALS", "value": "RAW_EVENTS" }
                        ]
                    }
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["run_as"], "alice");
        body["data"]["id"].as_i64().unwrap()
    }
}

#[tokio::test]
async fn test_unconstrained_filter_rejected() {
    let app = test_app();
    let (status, body) = app
        .call(
            "POST",
            "/api/filters",
            Some(json!({
                "name": "everything",
                "processor_kind": "noop",
                "expression": { "op": "AND", "children": [] }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "INVALID_EXPRESSION");
}

#[tokio::test]
async fn test_create_assign_and_report_flow() {
    let app = test_app();
    for _ in 0..3 {
        app.metas
            .append(MetaRecordBuilder::new().with_type("RAW_EVENTS").build())
            .unwrap();
    }
    let filter_id = app.create_raw_events_filter().await;

    let (status, body) = app.call("POST", "/api/admin/create-tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["tasks_created"], 3);

    let (status, body) = app
        .call(
            "POST",
            "/api/nodes/node-a/tasks/assign",
            Some(json!({ "max_count": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let handles = body["data"].as_array().unwrap();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0]["filter_id"], filter_id);
    let task_id = handles[0]["task_id"].as_i64().unwrap();

    // 其他节点不能汇报
    let (status, _) = app
        .call(
            "POST",
            &format!("/api/tasks/{task_id}/outcome"),
            Some(json!({ "task_id": task_id, "node_name": "node-b", "outcome": "COMPLETE" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .call(
            "POST",
            &format!("/api/tasks/{task_id}/outcome"),
            Some(json!({
                "task_id": task_id,
                "node_name": "node-a",
                "outcome": "COMPLETE",
                "records_read": 10,
                "records_written": 8
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "COMPLETE");

    let (status, body) = app
        .call("POST", "/api/nodes/node-a/tasks/release", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["released"], 1);

    let all = app.tasks.find(&TaskQuery::default()).await.unwrap();
    assert_eq!(all.iter().filter(|t| t.status == TaskStatus::Complete).count(), 1);
    assert_eq!(all.iter().filter(|t| t.status == TaskStatus::Unassigned).count(), 2);

    let (status, body) = app.call("GET", &format!("/api/tasks/{task_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["records_written"], 8);
}

#[tokio::test]
async fn test_outcome_path_mismatch() {
    let app = test_app();
    let (status, _) = app
        .call(
            "POST",
            "/api/tasks/1/outcome",
            Some(json!({ "task_id": 2, "node_name": "node-a", "outcome": "FAILED" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_filter_lifecycle() {
    let app = test_app();
    let id = app.create_raw_events_filter().await;

    let (status, body) = app.call("POST", &format!("/api/filters/{id}/disable"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);

    let (_, body) = app
        .call("POST", &format!("/api/filters/{id}/priority"), Some(json!({ "priority": 42 })))
        .await;
    assert_eq!(body["data"]["priority"], 42);

    let (status, body) = app.call("GET", &format!("/api/filters/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "raw events");
    assert_eq!(body["data"]["tracker"]["min_meta_id"], 0);

    let (status, _) = app.call("POST", &format!("/api/filters/{id}/reset"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.call("DELETE", &format!("/api/filters/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app.call("GET", &format!("/api/filters/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "FILTER_NOT_FOUND");
}

#[tokio::test]
async fn test_tuning_partial_update() {
    let app = test_app();
    let (status, body) = app
        .call(
            "PUT",
            "/api/admin/tuning",
            Some(json!({ "queue_size_cap": 50, "assign_tasks": false })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["queue_size_cap"], 50);
    assert_eq!(body["data"]["assign_tasks"], false);
    assert_eq!(body["data"]["assignment_timeout_seconds"], 600);

    let (status, _) = app
        .call("PUT", "/api/admin/tuning", Some(json!({ "queue_size_cap": 0 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = app.call("GET", "/api/admin/tuning", None).await;
    assert_eq!(body["data"]["queue_size_cap"], 50);
}

#[tokio::test]
async fn test_progress_before_and_after_pass() {
    let app = test_app();
    let (_, body) = app.call("GET", "/api/admin/progress", None).await;
    assert_eq!(body["data"]["running"], false);
    assert!(body["data"]["last_report"].is_null());

    app.call("POST", "/api/admin/create-tasks", None).await;
    let (_, body) = app.call("GET", "/api/admin/progress", None).await;
    assert_eq!(body["data"]["last_report"]["tasks_created"], 0);
}
