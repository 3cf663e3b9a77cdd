//! Errors raised by the GKE and Kubernetes adapters.

use lifecycle::RemoteError;
use thiserror::Error;

/// Errors that can occur while talking to GKE or a cluster's API server.
#[derive(Error, Debug)]
pub enum CloudError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Manifest could not be parsed.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Kubernetes API error.
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A workload reached a state it will not recover from.
    #[error("Workload failed: {0}")]
    Workload(String),

    /// Local file system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudError {
    /// Whether the Kubernetes API answered 404.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api { status, .. } => *status == 404,
            Self::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    /// Whether the API server rejected our credentials.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Auth(_) => true,
            Self::Api { status, .. } => *status == 401,
            Self::Kube(kube::Error::Api(response)) => response.code == 401,
            _ => false,
        }
    }
}

impl From<CloudError> for RemoteError {
    fn from(error: CloudError) -> Self {
        let detail = error.to_string();
        match error {
            e if e.is_not_found() => RemoteError::NotFound(detail),
            CloudError::Http(_) | CloudError::Timeout(_) => RemoteError::Transport(detail),
            CloudError::Api { status, .. } if status == 429 || status >= 500 => {
                RemoteError::Transport(detail)
            }
            CloudError::Kube(kube::Error::Api(ref response))
                if response.code == 429 || response.code >= 500 =>
            {
                RemoteError::Transport(detail)
            }
            CloudError::Kube(kube::Error::Api(_)) => RemoteError::Rejected(detail),
            CloudError::Kube(_) => RemoteError::Transport(detail),
            _ => RemoteError::Rejected(detail),
        }
    }
}
