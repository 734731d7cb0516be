//! HTTP surface tests
//!
//! Each test starts the router on an ephemeral port next to mock provider
//! and upstream servers, then talks to it with reqwest (redirects not followed).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
};
use reqwest::{Client, header::LOCATION, redirect::Policy};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

use postflow::config::{Config, PoolConfig, ProviderConfig, default_retryable_status_codes};
use postflow::oauth::{Provider, TokenStorage};
use postflow::rotation::KeyPlacement;
use postflow::server::{Server, create_router};
use postflow::store::{KeyValueStore, MemoryStore};

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Token endpoint that counts exchanges
async fn spawn_token_endpoint(exchanges: Arc<AtomicUsize>) -> SocketAddr {
    let router = Router::new()
        .route(
            "/oauth/access_token",
            post(
                |State(exchanges): State<Arc<AtomicUsize>>,
                 Form(form): Form<HashMap<String, String>>| async move {
                    exchanges.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "access_token": format!("token-for-{}", form["code"]),
                        "token_type": "bearer",
                        "expires_in": 3600
                    }))
                },
            ),
        )
        .with_state(exchanges);
    spawn(router).await
}

/// Upstream that only accepts the key `good-key-0123456789`
async fn spawn_upstream() -> SocketAddr {
    let router = Router::new().route(
        "/v1/models",
        get(|Query(q): Query<HashMap<String, String>>| async move {
            match q.get("key").map(String::as_str) {
                Some("good-key-0123456789") => (
                    StatusCode::OK,
                    Json(json!({ "models": ["gemini-pro"], "alt": q.get("alt") })),
                ),
                _ => (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "error": "quota exceeded" })),
                ),
            }
        }),
    );
    spawn(router).await
}

fn pool(keys: &[&str], base_url: String) -> PoolConfig {
    PoolConfig {
        keys: keys.iter().map(ToString::to_string).collect(),
        placement: KeyPlacement::query("key"),
        retry_delay: Duration::from_millis(1),
        max_retries: None,
        retryable_status_codes: default_retryable_status_codes(),
        base_url: Some(base_url),
        timeout: Duration::from_secs(5),
    }
}

/// Bind postflow first so the redirect URI can carry its real address
async fn spawn_postflow(mut config: Config) -> (SocketAddr, Arc<dyn KeyValueStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.server.public_url = format!("http://{addr}");

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let state = Server::with_store(config, Arc::clone(&store))
        .app_state()
        .unwrap();
    let router = create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, store)
}

fn client() -> Client {
    Client::builder().redirect(Policy::none()).build().unwrap()
}

fn location(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn health() {
    let (addr, _) = spawn_postflow(Config::default()).await;
    let body: Value = client()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn authorize_then_callback_connects_once() {
    let exchanges = Arc::new(AtomicUsize::new(0));
    let token_addr = spawn_token_endpoint(Arc::clone(&exchanges)).await;

    let mut config = Config::default();
    config.oauth.providers.insert(
        Provider::Facebook,
        ProviderConfig {
            authorization_endpoint: "https://www.facebook.com/v18.0/dialog/oauth".to_string(),
            token_endpoint: format!("http://{token_addr}/oauth/access_token"),
            client_id: "app-123".to_string(),
            client_secret: Some("secret".to_string()),
            scopes: vec!["pages_manage_posts".to_string(), "pages_show_list".to_string()],
        },
    );
    let (addr, store) = spawn_postflow(config).await;
    let tokens = TokenStorage::new(Arc::clone(&store));
    let http = client();

    let authorize = http
        .get(format!("http://{addr}/oauth/facebook/authorize"))
        .send()
        .await
        .unwrap();
    assert_eq!(authorize.status(), StatusCode::SEE_OTHER);

    let dialog = Url::parse(&location(&authorize)).unwrap();
    assert_eq!(dialog.host_str(), Some("www.facebook.com"));
    let params: HashMap<String, String> = dialog.query_pairs().into_owned().collect();
    assert_eq!(params["client_id"], "app-123");
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["scope"], "pages_manage_posts,pages_show_list");
    assert_eq!(
        params["redirect_uri"],
        format!("http://{addr}/oauth/facebook/callback")
    );
    let state = params["state"].clone();

    let callback_url = format!("http://{addr}/oauth/facebook/callback?code=abc123&state={state}");
    let callback = http.get(&callback_url).send().await.unwrap();
    assert_eq!(callback.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&callback), "/dashboard?connected=facebook");
    assert_eq!(exchanges.load(Ordering::SeqCst), 1);

    let saved = tokens.load(Provider::Facebook).await.unwrap().unwrap();
    assert_eq!(saved.access_token, "token-for-abc123");
    assert!(saved.expires_at.is_some());
    assert!(tokens.load(Provider::Instagram).await.unwrap().is_none());

    let replay = http.get(&callback_url).send().await.unwrap();
    assert_eq!(replay.status(), StatusCode::SEE_OTHER);
    assert!(location(&replay).starts_with("/auth/error?error="));
    assert_eq!(exchanges.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn callback_with_provider_error_redirects_to_error_path() {
    let (addr, _) = spawn_postflow(Config::default()).await;

    let response = client()
        .get(format!(
            "http://{addr}/oauth/instagram/callback?error=access_denied&error_description=User+cancelled"
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        location(&response),
        "/auth/error?error=access_denied%3A+User+cancelled"
    );
}

#[tokio::test]
async fn failed_exchange_stores_no_token() {
    let token_endpoint = spawn(Router::new().route(
        "/oauth/access_token",
        post(|| async { (StatusCode::BAD_REQUEST, "invalid code") }),
    ))
    .await;

    let mut config = Config::default();
    config.oauth.providers.insert(
        Provider::Instagram,
        ProviderConfig {
            authorization_endpoint: "https://api.instagram.com/oauth/authorize".to_string(),
            token_endpoint: format!("http://{token_endpoint}/oauth/access_token"),
            client_id: "ig-app".to_string(),
            client_secret: None,
            scopes: vec![],
        },
    );
    let (addr, store) = spawn_postflow(config).await;

    let response = client()
        .get(format!("http://{addr}/oauth/instagram/callback?code=bad&state=unknown"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(location(&response).starts_with("/auth/error?error="));
    assert!(
        TokenStorage::new(store)
            .load(Provider::Instagram)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let (addr, _) = spawn_postflow(Config::default()).await;

    let response = client()
        .get(format!("http://{addr}/oauth/myspace/authorize"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proxy_rotates_past_exhausted_keys() {
    let upstream = spawn_upstream().await;
    let mut config = Config::default();
    config.pools.insert(
        "gemini".to_string(),
        pool(
            &["spent-key-aaaaaaaaaa", "spent-key-bbbbbbbbbb", "good-key-0123456789"],
            format!("http://{upstream}"),
        ),
    );
    let (addr, _) = spawn_postflow(config).await;
    let http = client();

    let response = http
        .get(format!("http://{addr}/proxy/gemini/v1/models?alt=json"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["models"][0], "gemini-pro");
    assert_eq!(body["alt"], "json");

    let stats: Value = http
        .get(format!("http://{addr}/keys/gemini/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_keys"], 3);
    assert_eq!(stats["current_key_preview"], "good-key...6789");
}

#[tokio::test]
async fn proxy_reports_exhausted_pool_as_bad_gateway() {
    let upstream = spawn_upstream().await;
    let mut config = Config::default();
    config.pools.insert(
        "pixabay".to_string(),
        pool(
            &["spent-key-aaaaaaaaaa", "spent-key-bbbbbbbbbb"],
            format!("http://{upstream}"),
        ),
    );
    let (addr, _) = spawn_postflow(config).await;

    let response = client()
        .get(format!("http://{addr}/proxy/pixabay/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn unknown_pool_is_not_found() {
    let (addr, _) = spawn_postflow(Config::default()).await;

    let http = client();
    let stats = http
        .get(format!("http://{addr}/keys/nope/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(stats.status(), StatusCode::NOT_FOUND);

    let proxy = http
        .get(format!("http://{addr}/proxy/nope/anything"))
        .send()
        .await
        .unwrap();
    assert_eq!(proxy.status(), StatusCode::NOT_FOUND);
}
