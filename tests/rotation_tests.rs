//! Key rotation against a live HTTP upstream

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    routing::{get, post},
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use postflow::Error;
use postflow::rotation::{
    ApiRequest, KeyPlacement, KeyRotationManager, ReqwestTransport, RotationConfig,
};

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn fast() -> RotationConfig {
    RotationConfig {
        retry_delay: Duration::from_millis(1),
        ..RotationConfig::default()
    }
}

fn manager(keys: &[&str], placement: KeyPlacement) -> KeyRotationManager {
    KeyRotationManager::new(
        "runware",
        keys.iter().map(ToString::to_string).collect(),
        placement,
        fast(),
        Arc::new(ReqwestTransport::with_timeout(Duration::from_secs(5)).unwrap()),
    )
    .unwrap()
}

/// Upstream authorizing by bearer token; every other token is over quota
async fn spawn_bearer_upstream(seen: Arc<Mutex<Vec<String>>>) -> SocketAddr {
    let router = Router::new().route(
        "/v1/tasks",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let seen = Arc::clone(&seen);
            async move {
                let auth = headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                seen.lock().push(auth.clone());
                if auth == "Bearer live" {
                    (StatusCode::OK, Json(json!({ "echo": body })))
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "busy" })))
                }
            }
        }),
    );
    spawn(router).await
}

#[tokio::test]
async fn bearer_rotation_preserves_body() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_bearer_upstream(Arc::clone(&seen)).await;
    let mgr = manager(&["stale", "live"], KeyPlacement::bearer());

    let request = ApiRequest::post(format!("http://{addr}/v1/tasks"))
        .json(&json!({ "prompt": "sunset over fjord" }));
    let response = mgr.execute(&request).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    let body: Value = response.json().unwrap();
    assert_eq!(body["echo"]["prompt"], "sunset over fjord");
    assert_eq!(*seen.lock(), vec!["Bearer stale", "Bearer live"]);
    assert_eq!(mgr.pool().current_key(), "live");
}

#[tokio::test]
async fn template_placement_fills_path_segment() {
    let router = Router::new().route(
        "/api/{key}/search",
        get(|Path(key): Path<String>| async move {
            if key == "k2" {
                (StatusCode::OK, Json(json!({ "hits": 3 })))
            } else {
                (StatusCode::TOO_MANY_REQUESTS, Json(json!({})))
            }
        }),
    );
    let addr = spawn(router).await;
    let mgr = manager(
        &["k1", "k2"],
        KeyPlacement::Template {
            placeholder: "{key}".to_string(),
        },
    );

    let response = mgr
        .execute(&ApiRequest::get(format!("http://{addr}/api/{{key}}/search")))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json::<HashMap<String, u32>>().unwrap()["hits"], 3);
}

#[tokio::test]
async fn non_retryable_status_is_returned_without_rotation() {
    let router = Router::new().route(
        "/v1/missing",
        get(|| async { (StatusCode::NOT_FOUND, "no such model") }),
    );
    let addr = spawn(router).await;
    let mgr = manager(&["a", "b", "c"], KeyPlacement::query("key"));

    let response = mgr
        .execute(&ApiRequest::get(format!("http://{addr}/v1/missing")))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.text(), "no such model");
    assert_eq!(mgr.pool().current_key(), "a");
}

#[tokio::test]
async fn unreachable_upstream_exhausts_every_key() {
    // Bind then drop to get a port nothing listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mgr = manager(&["a", "b", "c"], KeyPlacement::query("key"));

    let err = mgr
        .execute(&ApiRequest::get(format!("http://{addr}/")))
        .await
        .unwrap_err();

    match err {
        Error::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    // Three rotations bring a three-key pool back to its first key
    assert_eq!(mgr.pool().current_key(), "a");
}
