//! OAuth2 access tokens for Google APIs.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::models::MetadataToken;
use crate::error::CloudError;

/// Token endpoint of the GCE metadata server for the default service account.
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the metadata server says a token expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Where access tokens come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A fixed token, e.g. from `gcloud auth print-access-token`.
    Static(String),
    /// The metadata server of the VM or pod we run on.
    Metadata { url: String },
}

impl TokenSource {
    /// The default service account of the current GCE instance.
    #[must_use]
    pub fn metadata() -> Self {
        Self::Metadata {
            url: METADATA_TOKEN_URL.to_string(),
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

/// Hands out bearer tokens, caching metadata-server tokens until shortly
/// before they expire.
pub struct TokenProvider {
    source: TokenSource,
    http: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    #[must_use]
    pub fn new(source: TokenSource, http: Client) -> Self {
        Self {
            source,
            http,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token.
    ///
    /// # Errors
    /// [`CloudError::Auth`] if the metadata server cannot issue a token.
    pub async fn token(&self) -> Result<String, CloudError> {
        let url = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata { url } => url,
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at.is_none_or(|at| Instant::now() < at) {
                return Ok(token.value.clone());
            }
        }

        debug!(url = %url, "Fetching access token from metadata server");
        let response = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(format!(
                "metadata server returned {status}: {text}"
            )));
        }
        let token: MetadataToken = response.json().await?;

        let expires_at = (token.expires_in > 0).then(|| {
            Instant::now() + Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN)
        });
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    /// Drop the cached token so the next call fetches a fresh one.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
