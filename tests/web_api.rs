//! Router-level tests for the trigger and operator endpoints.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use outbox_sync::error::RemoteError;
use outbox_sync::web::{create_router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(harness: &TestHarness) -> Router {
    create_router(AppState::new(harness.engine.clone(), "test"))
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_without_database() {
    let harness = TestHarness::new();
    let (status, body) = send(router(&harness), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["environment"], "test");
    assert_eq!(body["database"], Value::Null);
}

#[tokio::test]
async fn test_process_on_empty_queue_returns_zero_counts() {
    let harness = TestHarness::new();
    let request = Request::post("/sync/process").body(Body::empty()).unwrap();
    let (status, body) = send(router(&harness), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"processed": 0, "completed": 0, "failed": 0, "deadLettered": 0})
    );
}

#[tokio::test]
async fn test_process_drains_enqueued_items() {
    let harness = TestHarness::new();
    harness
        .engine
        .enqueue("p-1", booking_items("p-1"))
        .await
        .unwrap();

    let (status, body) = send(
        router(&harness),
        post_json("/sync/process", json!({"batchSize": 10})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 3);
    assert_eq!(body["completed"], 3);
}

#[tokio::test]
async fn test_process_rejects_out_of_range_batch_sizes() {
    let harness = TestHarness::new();

    for batch_size in [0, 501] {
        let (status, body) = send(
            router(&harness),
            post_json("/sync/process", json!({"batchSize": batch_size})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }
}

#[tokio::test]
async fn test_report_lists_blocked_correlations() {
    let harness = TestHarness::new();
    harness.remote.fail_always(
        "proposal",
        RemoteError::Client {
            status: 400,
            body: "rejected".to_string(),
        },
    );
    harness
        .engine
        .enqueue("p-1", booking_items("p-1"))
        .await
        .unwrap();
    harness.engine.run_once(None).await.unwrap();
    harness.engine.run_once(None).await.unwrap();

    let (status, body) = send(router(&harness), get("/sync/report")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counts"]["deadLettered"], 1);
    assert_eq!(body["counts"]["pending"], 2);
    assert_eq!(body["blockedCorrelations"][0]["correlationId"], "p-1");
    assert_eq!(body["blockedCorrelations"][0]["blockedItems"], 2);
}

#[tokio::test]
async fn test_correlation_lookup() {
    let harness = TestHarness::new();
    harness
        .engine
        .enqueue("p-1", booking_items("p-1"))
        .await
        .unwrap();

    let (status, body) = send(router(&harness), get("/sync/correlations/p-1")).await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["sequence"], 1);
    assert_eq!(items[0]["status"], "pending");
    assert_eq!(items[1]["dependsOnExternalIdOf"], "p-1");

    let (status, body) = send(router(&harness), get("/sync/correlations/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_requeue_endpoint() {
    let harness = TestHarness::new();
    harness.remote.fail_always(
        "proposal",
        RemoteError::Client {
            status: 400,
            body: "rejected".to_string(),
        },
    );
    harness
        .engine
        .enqueue("p-1", booking_items("p-1"))
        .await
        .unwrap();
    harness.engine.run_once(None).await.unwrap();
    harness.engine.run_once(None).await.unwrap();
    let head = harness.correlation("p-1").await.remove(0);

    let requeue = |id: i64| {
        Request::post(format!("/sync/dead-letters/{id}/requeue"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(router(&harness), requeue(head.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"itemId": head.id, "requeued": true}));

    let (status, _) = send(router(&harness), requeue(head.id)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(router(&harness), requeue(424_242)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
