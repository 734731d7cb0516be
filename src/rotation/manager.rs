//! Rotating retry loop

use std::sync::Arc;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::RotationConfig;
use super::pool::{CredentialPool, PoolStats, mask_key};
use super::request::{ApiRequest, ApiResponse, KeyPlacement};
use super::transport::HttpTransport;
use crate::config::PoolConfig;
use crate::{Error, Result};

/// Runs requests against a key pool, failing over to the next key on
/// quota/transient errors.
pub struct KeyRotationManager {
    /// Pool name (for logs)
    name: String,
    pool: CredentialPool,
    placement: KeyPlacement,
    config: RotationConfig,
    transport: Arc<dyn HttpTransport>,
}

impl KeyRotationManager {
    /// Create a manager
    pub fn new(
        name: impl Into<String>,
        keys: Vec<String>,
        placement: KeyPlacement,
        config: RotationConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        if config.max_retries == Some(0) {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        Ok(Self {
            name: name.into(),
            pool: CredentialPool::new(keys)?,
            placement,
            config,
            transport,
        })
    }

    /// Create a manager from a configured pool
    pub fn from_config(
        name: &str,
        pool: &PoolConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        Self::new(
            name,
            pool.resolved_keys(),
            pool.placement.clone(),
            RotationConfig::from(pool),
            transport,
        )
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying pool
    #[must_use]
    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Diagnostic snapshot of the pool
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Attempts per call: configured, else one per key
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config
            .max_retries
            .unwrap_or_else(|| u32::try_from(self.pool.len()).unwrap_or(u32::MAX))
            .max(1)
    }

    /// Execute a request with key rotation
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Execute a request with key rotation, aborting between attempts once
    /// `cancel` fires.
    ///
    /// Any status outside the retryable set is returned as-is, including
    /// 4xx. Retryable statuses and transport failures rotate the pool and try
    /// again until the attempt budget is spent.
    pub async fn execute_with_cancel(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let max_attempts = self.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let key = self.pool.current_key();
            let prepared = request.prepare(&key, &self.placement)?;

            match self.transport.send(prepared).await {
                Ok(response) if !self.config.is_retryable(response.status.as_u16()) => {
                    if attempt > 1 {
                        debug!(pool = %self.name, attempt, status = %response.status, "Request succeeded after rotation");
                    }
                    return Ok(response);
                }
                Ok(response) => {
                    warn!(
                        pool = %self.name,
                        attempt,
                        max_attempts,
                        status = %response.status,
                        key = %mask_key(&key),
                        "Retryable status, rotating key"
                    );
                    last_error = format!("HTTP {}", response.status);
                }
                Err(e) if e.is_transport() => {
                    warn!(
                        pool = %self.name,
                        attempt,
                        max_attempts,
                        error = %e,
                        key = %mask_key(&key),
                        "Transport failure, rotating key"
                    );
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }

            self.pool.rotate_if_current(&key);

            if attempt < max_attempts {
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = sleep(self.config.retry_delay) => {}
                }
            }
        }

        warn!(pool = %self.name, attempts = max_attempts, last_error = %last_error, "All key attempts failed");
        Err(Error::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use reqwest::StatusCode;

    use super::*;
    use crate::rotation::PreparedRequest;

    /// Replays scripted outcomes and records which key each attempt used
    struct Scripted {
        outcomes: Mutex<VecDeque<std::result::Result<u16, String>>>,
        fallback: u16,
        seen_keys: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(outcomes: Vec<std::result::Result<u16, String>>, fallback: u16) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                fallback,
                seen_keys: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl HttpTransport for Scripted {
        async fn send(&self, request: PreparedRequest) -> Result<ApiResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "key")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            self.seen_keys.lock().push(key);

            let next = self.outcomes.lock().pop_front().unwrap_or(Ok(self.fallback));
            match next {
                Ok(code) => Ok(ApiResponse::from_status(StatusCode::from_u16(code).unwrap())),
                Err(msg) => Err(Error::Transport(msg)),
            }
        }
    }

    fn manager(n: usize, transport: Arc<Scripted>) -> KeyRotationManager {
        let keys = (0..n).map(|i| format!("k{i}")).collect();
        let config = RotationConfig {
            retry_delay: Duration::from_millis(1),
            ..RotationConfig::default()
        };
        KeyRotationManager::new("gemini", keys, KeyPlacement::query("key"), config, transport)
            .unwrap()
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let transport = Scripted::new(vec![], 200);
        let mgr = manager(3, Arc::clone(&transport));

        let resp = mgr.execute(&ApiRequest::get("https://api.example.com/")).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.pool().current_key(), "k0");
    }

    #[tokio::test]
    async fn always_429_attempts_pool_size_then_exhausts() {
        let transport = Scripted::new(vec![], 429);
        let mgr = manager(4, Arc::clone(&transport));

        let err = mgr.execute(&ApiRequest::get("https://api.example.com/")).await.unwrap_err();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        assert_eq!(*transport.seen_keys.lock(), vec!["k0", "k1", "k2", "k3"]);
        match err {
            Error::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("429"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_status_passes_through_without_rotation() {
        let transport = Scripted::new(vec![Ok(404)], 200);
        let mgr = manager(3, Arc::clone(&transport));

        let resp = mgr.execute(&ApiRequest::get("https://api.example.com/")).await.unwrap();

        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.stats().key_order, vec!["***", "***", "***"]);
        assert_eq!(mgr.pool().current_key(), "k0");
    }

    #[tokio::test]
    async fn transport_error_fails_over_like_retryable_status() {
        let transport = Scripted::new(vec![Err("connection reset".into()), Ok(503)], 200);
        let mgr = manager(3, Arc::clone(&transport));

        let resp = mgr.execute(&ApiRequest::get("https://api.example.com/")).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(*transport.seen_keys.lock(), vec!["k0", "k1", "k2"]);
        // Both failed keys went to the back of the queue
        assert_eq!(mgr.pool().current_key(), "k2");
    }

    #[tokio::test]
    async fn explicit_max_retries_caps_attempts() {
        let transport = Scripted::new(vec![], 502);
        let keys = vec!["a".to_string(), "b".to_string()];
        let config = RotationConfig {
            retry_delay: Duration::from_millis(1),
            max_retries: Some(5),
            ..RotationConfig::default()
        };
        let mgr = KeyRotationManager::new(
            "runware",
            keys,
            KeyPlacement::query("key"),
            config,
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
        )
        .unwrap();

        let err = mgr.execute(&ApiRequest::get("https://api.example.com/")).await.unwrap_err();

        assert!(matches!(err, Error::RetriesExhausted { attempts: 5, .. }));
        assert_eq!(*transport.seen_keys.lock(), vec!["a", "b", "a", "b", "a"]);
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop() {
        let transport = Scripted::new(vec![], 429);
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let config = RotationConfig {
            retry_delay: Duration::from_secs(30),
            ..RotationConfig::default()
        };
        let mgr = KeyRotationManager::new(
            "gemini",
            keys,
            KeyPlacement::query("key"),
            config,
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = mgr
            .execute_with_cancel(&ApiRequest::get("https://api.example.com/"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_url_is_not_retried() {
        let transport = Scripted::new(vec![], 200);
        let mgr = manager(2, Arc::clone(&transport));

        let err = mgr.execute(&ApiRequest::get("not a url")).await.unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_max_retries_rejected() {
        let config = RotationConfig {
            max_retries: Some(0),
            ..RotationConfig::default()
        };
        let result = KeyRotationManager::new(
            "x",
            vec!["k".to_string()],
            KeyPlacement::query("key"),
            config,
            Scripted::new(vec![], 200),
        );
        assert!(result.is_err());
    }
}
