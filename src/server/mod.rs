//! HTTP server
//!
//! Hosts the OAuth authorize/callback endpoints and the key-rotating
//! upstream proxy.

mod router;

pub use router::{AppState, create_router};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::config::Config;
use crate::oauth::{self, TokenExchanger, TokenStorage};
use crate::rotation::{KeyRotationManager, ReqwestTransport};
use crate::store::{self, KeyValueStore};
use crate::{Error, Result};

/// postflow server
pub struct Server {
    config: Config,
    store: Arc<dyn KeyValueStore>,
}

impl Server {
    /// Create a server with the configured store
    pub fn new(config: Config) -> Result<Self> {
        let store = store::open(&config.storage)?;
        Ok(Self { config, store })
    }

    /// Create a server over an existing store
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn KeyValueStore>) -> Self {
        Self { config, store }
    }

    /// Build the shared state (pools, OAuth handler, exchanger, token storage)
    pub fn app_state(&self) -> Result<Arc<AppState>> {
        let mut pools = HashMap::new();
        for (name, pool) in &self.config.pools {
            let transport = Arc::new(ReqwestTransport::with_timeout(pool.timeout)?);
            let manager = KeyRotationManager::from_config(name, pool, transport)?;
            info!(pool = %name, keys = manager.pool().len(), "Registered key pool");
            pools.insert(name.clone(), Arc::new(manager));
        }

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("postflow/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Arc::new(AppState {
            callback: oauth::callback_handler(&self.store, &self.config.oauth),
            exchanger: TokenExchanger::new(http_client),
            tokens: TokenStorage::new(Arc::clone(&self.store)),
            pools,
            config: self.config.clone(),
        }))
    }

    /// Run until ctrl-c
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = self.app_state()?;
        let app = create_router(state);
        let listener = TcpListener::bind(addr).await?;

        info!(version = env!("CARGO_PKG_VERSION"), %addr, "postflow listening");
        for provider in self.config.oauth.providers.keys() {
            info!(
                "  GET {}/oauth/{provider}/authorize",
                self.config.server.public_url.trim_end_matches('/')
            );
        }
        if self.config.oauth.state_policy == oauth::StateValidationPolicy::Lenient {
            warn!("OAuth state policy is lenient: unverifiable states are accepted");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
