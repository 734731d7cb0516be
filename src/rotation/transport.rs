//! HTTP transport seam

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderName, HeaderValue};
use tracing::trace;

use super::request::{ApiResponse, PreparedRequest};
use crate::{Error, Result};

/// Sends one prepared request.
///
/// Returning `Err` with a transport-class error (see
/// [`Error::is_transport`]) makes the rotation manager fail over to the next
/// key, exactly like a retryable status.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// Send the request and buffer the response
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse>;
}

/// Production transport backed by `reqwest`
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Wrap an existing client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client with a request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("postflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse> {
        trace!(method = %request.method, host = ?request.url.host_str(), "Sending request");

        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("Invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("Invalid header value for '{name}': {e}")))?;
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
