//! OAuth callback orchestration
//!
//! Drives one provider redirect through state validation and replay
//! protection, then hands the code to a caller-supplied continuation. Every
//! path ends in a success or error redirect; nothing propagates to the
//! caller as an `Err`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::Provider;
use super::codes::AuthCodeTracker;
use super::state::{OAuthStateManager, StateRejection};
use crate::Result;

/// OAuth callback query parameters
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse from a raw (still percent-encoded) query string.
    /// Empty values count as absent.
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            slot.get_or_insert_with(|| value.into_owned());
        }
        params
    }
}

/// What to do when the state token does not validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateValidationPolicy {
    /// Fall back to the last issued state, then accept any redirect that
    /// carries both `code=` and `state=`. Tolerates storage being cleared
    /// or partitioned between authorize and callback.
    #[default]
    Lenient,
    /// Reject the callback. No fallback: expired, consumed and unknown
    /// states all fail.
    Strict,
}

/// Why a callback failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackFailure {
    /// Provider redirected with `error=`
    ProviderError,
    /// No `code` parameter
    MissingCode,
    /// No `state` parameter
    MissingState,
    /// State did not validate (strict policy only)
    StateRejected,
    /// Code was already exchanged
    CodeAlreadyUsed,
    /// Continuation or storage failed
    Processing,
}

impl fmt::Display for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProviderError => "provider_error",
            Self::MissingCode => "missing_code",
            Self::MissingState => "missing_state",
            Self::StateRejected => "state_rejected",
            Self::CodeAlreadyUsed => "code_already_used",
            Self::Processing => "processing_error",
        };
        f.write_str(s)
    }
}

/// Terminal result of one callback
#[derive(Debug, Clone)]
pub enum CallbackOutcome<T> {
    /// Code exchanged; send the browser to `redirect`
    Success {
        /// Success path
        redirect: String,
        /// The authorization code
        code: String,
        /// The state token
        state: String,
        /// Whatever the continuation produced
        value: T,
    },
    /// Flow failed; send the browser to `redirect`
    Failure {
        /// Error path, carrying `?error=<message>`
        redirect: String,
        /// Failure class
        reason: CallbackFailure,
        /// User-facing message
        message: String,
    },
}

impl<T> CallbackOutcome<T> {
    /// Where the browser should go next
    #[must_use]
    pub fn redirect(&self) -> &str {
        match self {
            Self::Success { redirect, .. } | Self::Failure { redirect, .. } => redirect,
        }
    }

    /// `true` for [`CallbackOutcome::Success`]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Failure class, if any
    #[must_use]
    pub fn failure(&self) -> Option<CallbackFailure> {
        match self {
            Self::Failure { reason, .. } => Some(*reason),
            Self::Success { .. } => None,
        }
    }
}

/// Orchestrates the OAuth callback
pub struct CallbackHandler {
    states: Arc<OAuthStateManager>,
    codes: Arc<AuthCodeTracker>,
    policy: StateValidationPolicy,
    success_redirect: String,
    error_redirect: String,
}

impl CallbackHandler {
    /// Create a handler
    #[must_use]
    pub fn new(
        states: Arc<OAuthStateManager>,
        codes: Arc<AuthCodeTracker>,
        policy: StateValidationPolicy,
    ) -> Self {
        Self {
            states,
            codes,
            policy,
            success_redirect: "/dashboard".to_string(),
            error_redirect: "/auth/error".to_string(),
        }
    }

    /// Set the success and error paths
    #[must_use]
    pub fn with_redirects(mut self, success: impl Into<String>, error: impl Into<String>) -> Self {
        self.success_redirect = success.into();
        self.error_redirect = error.into();
        self
    }

    /// The state manager
    #[must_use]
    pub fn states(&self) -> &Arc<OAuthStateManager> {
        &self.states
    }

    /// The used-code tracker
    #[must_use]
    pub fn codes(&self) -> &Arc<AuthCodeTracker> {
        &self.codes
    }

    /// Handle a full redirect URL (or a path with a query string)
    pub async fn handle_url<F, Fut, T>(
        &self,
        provider: Provider,
        redirect_url: &str,
        continuation: F,
    ) -> CallbackOutcome<T>
    where
        F: FnOnce(String, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let query = redirect_url
            .split_once('?')
            .map_or("", |(_, q)| q.split('#').next().unwrap_or(""));
        self.handle(provider, query, continuation).await
    }

    /// Handle the raw query string of a provider redirect.
    ///
    /// `continuation` receives `(code, state)` and is called at most once,
    /// only after the state check and replay check have passed.
    pub async fn handle<F, Fut, T>(
        &self,
        provider: Provider,
        raw_query: &str,
        continuation: F,
    ) -> CallbackOutcome<T>
    where
        F: FnOnce(String, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Err(e) = self.states.cleanup_expired_states().await {
            warn!(error = %e, "OAuth state sweep failed");
        }

        let params = CallbackParams::from_query(raw_query);
        debug!(
            provider = %provider,
            has_code = params.code.is_some(),
            has_state = params.state.is_some(),
            has_error = params.error.is_some(),
            "Received OAuth callback"
        );

        if let Some(error) = params.error {
            let description = params
                .error_description
                .unwrap_or_else(|| "Unknown error".to_string());
            warn!(provider = %provider, error = %error, description = %description, "Provider returned an error");
            return self.fail(
                CallbackFailure::ProviderError,
                format!("{error}: {description}"),
            );
        }

        let Some(code) = params.code else {
            return self.fail(
                CallbackFailure::MissingCode,
                "Authorization code missing".to_string(),
            );
        };

        let Some(state) = params.state else {
            return self.fail(
                CallbackFailure::MissingState,
                "Security parameters missing".to_string(),
            );
        };

        if let Err(reason) = self.states.validate_state(&state, provider).await {
            if !self.accept_unverified_state(&state, provider, raw_query, reason).await {
                return self.fail(
                    CallbackFailure::StateRejected,
                    "Invalid or expired security state, please try connecting again".to_string(),
                );
            }
        }

        match self.codes.check_and_mark(&code, provider).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(provider = %provider, "Authorization code replay blocked");
                return self.fail(
                    CallbackFailure::CodeAlreadyUsed,
                    "Authorization code already used, please retry".to_string(),
                );
            }
            Err(e) => {
                error!(provider = %provider, error = %e, "Used-code tracking failed");
                return self.fail(CallbackFailure::Processing, e.to_string());
            }
        }

        match continuation(code.clone(), state.clone()).await {
            Ok(value) => {
                if let Err(e) = self.states.remove_state(&state).await {
                    warn!(error = %e, "Failed to remove OAuth state after success");
                }
                info!(provider = %provider, "OAuth connection completed");
                CallbackOutcome::Success {
                    redirect: with_query(&self.success_redirect, "connected", provider.as_str()),
                    code,
                    state,
                    value,
                }
            }
            Err(e) => {
                error!(provider = %provider, error = %e, "OAuth callback processing failed");
                self.fail(CallbackFailure::Processing, e.to_string())
            }
        }
    }

    /// Degraded-mode fallback for a state that failed validation. Strict
    /// policy never falls back.
    async fn accept_unverified_state(
        &self,
        state: &str,
        provider: Provider,
        raw_query: &str,
        reason: StateRejection,
    ) -> bool {
        if self.policy == StateValidationPolicy::Strict {
            return false;
        }
        if self.states.matches_last_known_state(state, provider).await {
            info!(provider = %provider, reason = %reason, "State accepted via last known value");
            return true;
        }
        if looks_like_oauth_return(raw_query) {
            warn!(
                provider = %provider,
                reason = %reason,
                "Proceeding with unverified OAuth state (lenient policy)"
            );
            return true;
        }
        false
    }

    fn fail<T>(&self, reason: CallbackFailure, message: String) -> CallbackOutcome<T> {
        CallbackOutcome::Failure {
            redirect: with_query(&self.error_redirect, "error", &message),
            reason,
            message,
        }
    }
}

/// A redirect that carries both parameters is treated as a genuine provider
/// return even when its state cannot be verified.
fn looks_like_oauth_return(raw_query: &str) -> bool {
    raw_query.contains("code=") && raw_query.contains("state=")
}

fn with_query(path: &str, key: &str, value: &str) -> String {
    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .append_pair(key, value)
        .finish();
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{path}{sep}{encoded}")
}
