//! HTTP router and handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, Method, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Redirect, Response},
    routing::{any, get},
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::Error;
use crate::config::Config;
use crate::oauth::{CallbackHandler, Provider, TokenExchanger, TokenStorage, build_authorization_url};
use crate::rotation::{ApiRequest, KeyRotationManager};

/// Shared application state
pub struct AppState {
    /// Loaded configuration
    pub config: Config,
    /// OAuth callback orchestrator
    pub callback: CallbackHandler,
    /// Code-for-token exchange
    pub exchanger: TokenExchanger,
    /// Exchanged provider tokens
    pub tokens: TokenStorage,
    /// Key pools by name
    pub pools: HashMap<String, Arc<KeyRotationManager>>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/oauth/{provider}/authorize", get(authorize_handler))
        .route("/oauth/{provider}/callback", get(callback_handler))
        .route("/keys/{pool}/stats", get(pool_stats_handler))
        .route("/proxy/{pool}/{*path}", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Start an authorization flow: issue state, send the browser to the provider
async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Response {
    let provider: Provider = match provider.parse() {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e.to_string()),
    };
    let settings = match state.config.provider(provider) {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e.to_string()),
    };

    let token = match state.callback.states().generate_state(provider).await {
        Ok(t) => t,
        Err(e) => {
            error!(provider = %provider, error = %e, "Failed to issue OAuth state");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "State storage unavailable");
        }
    };

    match build_authorization_url(
        &settings.authorization_endpoint,
        &settings.client_id,
        &settings.scopes,
        &state.config.server.redirect_uri(provider),
        &token,
    ) {
        Ok(url) => {
            debug!(provider = %provider, "Redirecting to authorization dialog");
            Redirect::to(url.as_str()).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Provider redirect target
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let provider: Provider = match provider.parse() {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e.to_string()),
    };

    let settings = state.config.provider(provider).ok().cloned();
    let redirect_uri = state.config.server.redirect_uri(provider);
    let exchanger = state.exchanger.clone();
    let tokens = state.tokens.clone();

    let outcome = state
        .callback
        .handle(provider, query.as_deref().unwrap_or(""), |code, _state| async move {
            let settings = settings.ok_or_else(|| {
                Error::Config(format!("OAuth provider not configured: {provider}"))
            })?;
            let token = exchanger
                .exchange(provider, &settings, &code, &redirect_uri)
                .await?;
            tokens.save(provider, &token).await
        })
        .await;

    if let Some(reason) = outcome.failure() {
        warn!(provider = %provider, reason = %reason, "OAuth callback failed");
    }
    Redirect::to(outcome.redirect()).into_response()
}

async fn pool_stats_handler(
    State(state): State<Arc<AppState>>,
    Path(pool): Path<String>,
) -> Response {
    match state.pools.get(&pool) {
        Some(manager) => Json(manager.stats()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("Unknown key pool: {pool}")),
    }
}

/// Forward a request upstream through a key pool
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path((pool, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(manager) = state.pools.get(&pool) else {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown key pool: {pool}"));
    };
    let Some(base_url) = state
        .config
        .pools
        .get(&pool)
        .and_then(|p| p.base_url.as_deref())
    else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Key pool '{pool}' has no base_url"),
        );
    };

    let mut url = format!("{}/{}", base_url.trim_end_matches('/'), path);
    if let Some(q) = query {
        url.push('?');
        url.push_str(&q);
    }

    let mut request = ApiRequest::new(method, url);
    if let Some(ct) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        request = request.header("Content-Type", ct);
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    match manager.execute(&request).await {
        Ok(upstream) => {
            let mut response = (upstream.status, upstream.body).into_response();
            if let Some(ct) = upstream.headers.get(CONTENT_TYPE) {
                response.headers_mut().insert(CONTENT_TYPE, ct.clone());
            }
            response
        }
        Err(e @ Error::RetriesExhausted { .. }) => {
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(e @ Error::Config(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
