//! Outbound request descriptors and key injection

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Where the active key is injected into an outbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeyPlacement {
    /// `?<name>=<key>` (e.g. Gemini's `key`)
    Query {
        /// Query parameter name
        name: String,
    },
    /// `<name>: <prefix><key>` (e.g. `Authorization: Bearer <key>`)
    Header {
        /// Header name
        name: String,
        /// Value prefix
        #[serde(default)]
        prefix: String,
    },
    /// Substitute a placeholder inside the URL template
    Template {
        /// Placeholder text, e.g. `{key}`
        #[serde(default = "default_placeholder")]
        placeholder: String,
    },
}

fn default_placeholder() -> String {
    "{key}".to_string()
}

impl KeyPlacement {
    /// `?key=<key>`
    #[must_use]
    pub fn query(name: impl Into<String>) -> Self {
        Self::Query { name: name.into() }
    }

    /// `Authorization: Bearer <key>`
    #[must_use]
    pub fn bearer() -> Self {
        Self::Header {
            name: "Authorization".to_string(),
            prefix: "Bearer ".to_string(),
        }
    }
}

/// A request to run against a key pool
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Target URL, or URL template for [`KeyPlacement::Template`]
    pub url: String,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Option<Bytes>,
    /// Overrides the pool's default placement
    pub placement: Option<KeyPlacement>,
}

impl ApiRequest {
    /// Create a request
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            placement: None,
        }
    }

    /// GET request
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// POST request
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// JSON body (sets `Content-Type`)
    #[must_use]
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.body = Some(Bytes::from(value.to_string()));
        self.header("Content-Type", "application/json")
    }

    /// Raw body
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Override where the key goes
    #[must_use]
    pub fn placement(mut self, placement: KeyPlacement) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Resolve the request for one attempt with `key` injected
    pub fn prepare(&self, key: &str, default_placement: &KeyPlacement) -> Result<PreparedRequest> {
        let placement = self.placement.as_ref().unwrap_or(default_placement);
        let mut headers = self.headers.clone();

        let url = match placement {
            KeyPlacement::Query { name } => {
                let mut url = parse_url(&self.url)?;
                let kept: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != name.as_str())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                {
                    let mut pairs = url.query_pairs_mut();
                    pairs.clear();
                    for (k, v) in &kept {
                        pairs.append_pair(k, v);
                    }
                    pairs.append_pair(name, key);
                }
                url
            }
            KeyPlacement::Header { name, prefix } => {
                headers.retain(|(h, _)| !h.eq_ignore_ascii_case(name));
                headers.push((name.clone(), format!("{prefix}{key}")));
                parse_url(&self.url)?
            }
            KeyPlacement::Template { placeholder } => {
                if !self.url.contains(placeholder.as_str()) {
                    return Err(Error::Config(format!(
                        "URL template has no '{placeholder}' placeholder"
                    )));
                }
                let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
                parse_url(&self.url.replace(placeholder.as_str(), &encoded))?
            }
        };

        Ok(PreparedRequest {
            method: self.method.clone(),
            url,
            headers,
            body: self.body.clone(),
        })
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::Config(format!("Invalid request URL: {e}")))
}

/// A single attempt, ready for the transport
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// HTTP method
    pub method: Method,
    /// Final URL
    pub url: Url,
    /// Headers, including any injected key
    pub headers: Vec<(String, String)>,
    /// Body
    pub body: Option<Bytes>,
}

/// Upstream response. Only the status drives retry decisions.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Bytes,
}

impl ApiResponse {
    /// Response with an empty body
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Parse the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as UTF-8 (lossy)
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
