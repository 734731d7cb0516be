//! Configuration management

use std::{collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::oauth::{Provider, StateValidationPolicy};
use crate::rotation::KeyPlacement;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Persistence for OAuth state and used codes
    pub storage: StorageConfig,
    /// OAuth flow configuration
    pub oauth: OAuthConfig,
    /// Named credential pools (e.g. `gemini`, `runware`, `pixabay`)
    pub pools: HashMap<String, PoolConfig>,
}

impl Config {
    /// Load configuration from an optional YAML file plus `POSTFLOW_` env vars
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // POSTFLOW_SERVER__PORT=9000 -> server.port
        figment = figment.merge(Env::prefixed("POSTFLOW_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work at runtime
    pub fn validate(&self) -> Result<()> {
        for (name, pool) in &self.pools {
            if pool.keys.is_empty() {
                return Err(Error::Config(format!("Pool '{name}' has no keys")));
            }
            if pool.max_retries == Some(0) {
                return Err(Error::Config(format!(
                    "Pool '{name}': max_retries must be at least 1"
                )));
            }
        }
        if self.oauth.state_ttl.is_zero() {
            return Err(Error::Config("oauth.state_ttl must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Look up a pool by name
    pub fn pool(&self, name: &str) -> Result<&PoolConfig> {
        self.pools
            .get(name)
            .ok_or_else(|| Error::Config(format!("Unknown key pool: {name}")))
    }

    /// Refuse commands whose state must outlive this process when the store
    /// is in-memory
    pub fn require_persistent_storage(&self, command: &str) -> Result<()> {
        if self.storage.is_persistent() {
            return Ok(());
        }
        Err(Error::Config(format!(
            "'{command}' needs storage.backend: file; an in-memory store is not shared with the server"
        )))
    }

    /// Look up an OAuth provider's settings
    pub fn provider(&self, provider: Provider) -> Result<&ProviderConfig> {
        self.oauth
            .providers
            .get(&provider)
            .ok_or_else(|| Error::Config(format!("OAuth provider not configured: {provider}")))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL, used to build OAuth redirect URIs
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            public_url: "http://127.0.0.1:8787".to_string(),
        }
    }
}

impl ServerConfig {
    /// Redirect URI registered with a provider
    #[must_use]
    pub fn redirect_uri(&self, provider: Provider) -> String {
        format!(
            "{}/oauth/{provider}/callback",
            self.public_url.trim_end_matches('/')
        )
    }
}

/// Which store backs the OAuth tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on restart
    #[default]
    Memory,
    /// JSON files on disk
    File,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend type
    pub backend: StorageBackend,
    /// Directory for the file backend (default: ~/.postflow/state)
    pub directory: Option<PathBuf>,
}

impl StorageConfig {
    /// Whether stored state outlives the process
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.backend == StorageBackend::File
    }
}

/// OAuth flow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Lifetime of an issued state token
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// How long a consumed authorization code blocks replays
    #[serde(with = "humantime_serde")]
    pub code_retention: Duration,
    /// What to do when state validation fails but the redirect looks genuine
    pub state_policy: StateValidationPolicy,
    /// Where to send the browser after a successful connection
    pub success_redirect: String,
    /// Where to send the browser after a failed connection
    pub error_redirect: String,
    /// Provider settings
    pub providers: HashMap<Provider, ProviderConfig>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(30 * 60),
            code_retention: Duration::from_secs(60 * 60),
            state_policy: StateValidationPolicy::default(),
            success_redirect: "/dashboard".to_string(),
            error_redirect: "/auth/error".to_string(),
            providers: HashMap::new(),
        }
    }
}

/// Per-provider OAuth client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Authorization dialog endpoint
    pub authorization_endpoint: String,
    /// Token exchange endpoint
    pub token_endpoint: String,
    /// Client (app) id
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME`)
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Requested scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ProviderConfig {
    /// Resolve the client secret
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret.as_deref().map(resolve_secret)
    }
}

/// A named pool of interchangeable API keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Keys, in initial rotation order (each supports `env:VAR_NAME`)
    pub keys: Vec<String>,
    /// Where the active key goes on the outbound request
    pub placement: KeyPlacement,
    /// Pause between a failed attempt and the next one
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Attempts before giving up (default: pool size)
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Statuses that trigger rotation and retry
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
    /// Upstream base URL for `/proxy/{pool}/...`
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-attempt request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl PoolConfig {
    /// Keys with `env:` references expanded
    #[must_use]
    pub fn resolved_keys(&self) -> Vec<String> {
        self.keys.iter().map(|k| resolve_secret(k)).collect()
    }
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Statuses that signal quota or transient upstream failure
#[must_use]
pub fn default_retryable_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

/// Expand `env:VAR_NAME` references, falling back to the literal value
fn resolve_secret(value: &str) -> String {
    value
        .strip_prefix("env:")
        .and_then(|var| env::var(var).ok())
        .unwrap_or_else(|| value.to_string())
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "500ms")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    // "ms" must be checked before "s" and "m"
    let (digits, unit_secs, millis) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1, true)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1, false)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60, false)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600, false)
    } else {
        (s, 1, false)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration '{s}': {e}"))?;
    if millis {
        return Ok(Duration::from_millis(value));
    }
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{s}' is too large"))
}
