//! OAuth authorization-code flow for connecting social accounts
//!
//! Features:
//! - Single-use, time-limited state tokens (CSRF protection)
//! - Authorization code replay blocking
//! - Callback orchestration ending in a success or error redirect
//! - Token exchange against the provider's token endpoint, with the
//!   resulting access token persisted per provider

mod callback;
mod codes;
mod exchange;
mod provider;
mod state;
mod tokens;

pub use callback::{
    CallbackFailure, CallbackHandler, CallbackOutcome, CallbackParams, StateValidationPolicy,
};
pub use codes::{AuthCodeTracker, DEFAULT_CODE_RETENTION, UsedCode};
pub use exchange::{TokenExchanger, TokenInfo};
pub use provider::{Provider, build_authorization_url};
pub use state::{DEFAULT_STATE_TTL, OAuthStateManager, StateEntry, StateRejection};
pub use tokens::TokenStorage;

use std::sync::Arc;

use crate::config::OAuthConfig;
use crate::store::KeyValueStore;

/// Wire the state manager, code tracker and callback handler over one store
#[must_use]
pub fn callback_handler(store: &Arc<dyn KeyValueStore>, config: &OAuthConfig) -> CallbackHandler {
    let states = Arc::new(OAuthStateManager::new(Arc::clone(store), config.state_ttl));
    let codes = Arc::new(AuthCodeTracker::new(Arc::clone(store), config.code_retention));
    CallbackHandler::new(states, codes, config.state_policy)
        .with_redirects(&config.success_redirect, &config.error_redirect)
}
