//! Authorization code exchange
//!
//! The production success continuation for the callback handler: trades the
//! code for an access token at the provider's token endpoint.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Provider;
use crate::config::ProviderConfig;
use crate::{Error, Result};

/// OAuth token information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Access token
    pub access_token: String,

    /// Token type (usually "bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Token expiration time (Unix timestamp)
    #[serde(default)]
    pub expires_at: Option<u64>,

    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl TokenInfo {
    fn from_response(response: TokenResponse) -> Self {
        let expires_at = response.expires_in.map(|secs| unix_now() + secs);
        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(default_token_type),
            expires_at,
            scope: response.scope,
        }
    }

    /// Check if the token is expired (with 60 second buffer)
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| unix_now() + 60 >= exp)
    }

    /// Time until expiration
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = unix_now();
        self.expires_at
            .filter(|&exp| exp > now)
            .map(|exp| Duration::from_secs(exp - now))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    scope: Option<String>,
}

/// Exchanges authorization codes for tokens
#[derive(Clone)]
pub struct TokenExchanger {
    http_client: Client,
}

impl TokenExchanger {
    /// Create an exchanger
    #[must_use]
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }

    /// Exchange `code` for an access token
    pub async fn exchange(
        &self,
        provider: Provider,
        settings: &ProviderConfig,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenInfo> {
        let client_secret = settings.resolve_client_secret();

        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", settings.client_id.as_str()),
        ];
        if let Some(secret) = client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let response = self
            .http_client
            .post(&settings.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::OAuth(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::OAuth(format!(
                "Token exchange failed: HTTP {status} - {body}"
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::OAuth(format!("Failed to parse token response: {e}")))?;

        let token = TokenInfo::from_response(token_response);
        info!(provider = %provider, expires_in = ?token.time_until_expiry(), "Exchanged authorization code");
        Ok(token)
    }
}
