//! OAuth providers and authorization URL construction

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Social networks a user can connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Facebook Pages
    Facebook,
    /// Instagram business accounts
    Instagram,
}

impl Provider {
    /// Lowercase identifier used in routes, storage keys and config
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "facebook" => Ok(Self::Facebook),
            "instagram" => Ok(Self::Instagram),
            other => Err(Error::OAuth(format!("Unknown provider: {other}"))),
        }
    }
}

/// Build the provider authorization URL:
/// `base?client_id=..&redirect_uri=..&scope=..&response_type=code&state=..`
///
/// Scopes are comma-joined, as the Facebook login dialog expects.
pub fn build_authorization_url(
    base: &str,
    client_id: &str,
    scopes: &[String],
    redirect_uri: &str,
    state: &str,
) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::Config(format!("Invalid authorization endpoint: {e}")))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("client_id", client_id);
        params.append_pair("redirect_uri", redirect_uri);
        params.append_pair("scope", &scopes.join(","));
        params.append_pair("response_type", "code");
        params.append_pair("state", state);
    }

    Ok(url)
}
