//! HttpRemoteClient against a local axum server standing in for the remote API.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{patch, post};
use axum::{Json, Router};
use outbox_sync::config::RemoteConfig;
use outbox_sync::error::RemoteError;
use outbox_sync::remote::{HttpRemoteClient, RemoteApi};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct SeenRequest {
    method: &'static str,
    path: String,
    authorization: Option<String>,
    body: Option<Value>,
}

type Seen = Arc<Mutex<Vec<SeenRequest>>>;

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn create(
    State(seen): State<Seen>,
    Path(resource): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    seen.lock().push(SeenRequest {
        method: "POST",
        path: resource.clone(),
        authorization: authorization(&headers),
        body: Some(body.clone()),
    });

    match resource.as_str() {
        "proposal" => (StatusCode::CREATED, Json(json!({"id": "P-100", "echo": body}))).into_response(),
        "numbered" => Json(json!({"id": 42})).into_response(),
        "anonymous" => Json(json!({"status": "ok"})).into_response(),
        "broken" => (StatusCode::SERVICE_UNAVAILABLE, "try later").into_response(),
        "invalid" => (StatusCode::BAD_REQUEST, "title is required").into_response(),
        "busy" => (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "7")], "slow down").into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Json(json!({"id": "late"})).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn update(
    State(seen): State<Seen>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    seen.lock().push(SeenRequest {
        method: "PATCH",
        path: format!("{resource}/{id}"),
        authorization: authorization(&headers),
        body: Some(body),
    });
    if id == "gone" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn delete(
    State(seen): State<Seen>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    seen.lock().push(SeenRequest {
        method: "DELETE",
        path: format!("{resource}/{id}"),
        authorization: authorization(&headers),
        body: None,
    });
    StatusCode::OK
}

async fn start_remote() -> (SocketAddr, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/api/:resource", post(create))
        .route("/api/:resource/:id", patch(update).delete(delete))
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen)
}

fn client(addr: SocketAddr) -> HttpRemoteClient {
    HttpRemoteClient::new(&RemoteConfig {
        base_url: format!("http://{addr}/api"),
        token: Some("secret-token".to_string()),
        request_timeout_seconds: 1,
        ..RemoteConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_create_returns_assigned_id_and_sends_bearer_token() {
    let (addr, seen) = start_remote().await;
    let client = client(addr);

    let created = tokio_test::assert_ok!(client.create("proposal", &json!({"title": "Loft"})).await);
    assert_eq!(created.external_id, "P-100");
    assert_eq!(created.response["echo"], json!({"title": "Loft"}));

    let seen = seen.lock().clone();
    assert_eq!(
        seen,
        vec![SeenRequest {
            method: "POST",
            path: "proposal".to_string(),
            authorization: Some("Bearer secret-token".to_string()),
            body: Some(json!({"title": "Loft"})),
        }]
    );
}

#[tokio::test]
async fn test_numeric_ids_are_accepted() {
    let (addr, _) = start_remote().await;
    let created = client(addr).create("numbered", &json!({})).await.unwrap();
    assert_eq!(created.external_id, "42");
}

#[tokio::test]
async fn test_create_without_id_is_a_protocol_error() {
    let (addr, _) = start_remote().await;
    let result = client(addr).create("anonymous", &json!({})).await;
    assert!(matches!(result, Err(RemoteError::Protocol(_))));
}

#[tokio::test]
async fn test_status_codes_are_classified() {
    let (addr, _) = start_remote().await;
    let client = client(addr);

    assert_eq!(
        client.create("broken", &json!({})).await.unwrap_err(),
        RemoteError::Server {
            status: 503,
            body: "try later".to_string()
        }
    );
    assert_eq!(
        client.create("invalid", &json!({})).await.unwrap_err(),
        RemoteError::Client {
            status: 400,
            body: "title is required".to_string()
        }
    );
    assert_eq!(
        client.create("busy", &json!({})).await.unwrap_err(),
        RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(7))
        }
    );
    assert!(matches!(
        client.update("guest", "gone", &json!({})).await,
        Err(RemoteError::Client { status: 404, .. })
    ));
}

#[tokio::test]
async fn test_update_and_delete_address_the_external_id() {
    let (addr, seen) = start_remote().await;
    let client = client(addr);

    tokio_test::assert_ok!(client.update("guest", "G-7", &json!({"proposal": "P-100"})).await);
    tokio_test::assert_ok!(client.delete("guest", "G-7").await);

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].method, "PATCH");
    assert_eq!(seen[0].path, "guest/G-7");
    assert_eq!(seen[0].body, Some(json!({"proposal": "P-100"})));
    assert_eq!(seen[1].method, "DELETE");
    assert_eq!(seen[1].path, "guest/G-7");
    assert!(seen
        .iter()
        .all(|r| r.authorization.as_deref() == Some("Bearer secret-token")));
}

#[tokio::test]
async fn test_slow_remote_times_out() {
    let (addr, _) = start_remote().await;
    let result = client(addr).create("slow", &json!({})).await;
    assert_eq!(result.unwrap_err(), RemoteError::Timeout(Duration::from_secs(1)));
}

#[tokio::test]
async fn test_unreachable_remote_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = client(addr).create("proposal", &json!({})).await;
    assert!(matches!(result, Err(RemoteError::Network(_))));
}
