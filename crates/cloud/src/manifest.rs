//! Loading workload manifests from disk or GitHub.

use std::path::Path;

use lifecycle::Manifest;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::CloudError;

/// Branches tried, in order, when no branch is given for a GitHub manifest.
pub const DEFAULT_BRANCHES: [&str; 2] = ["main", "master"];

/// Read a manifest from a local file.
///
/// # Errors
/// [`CloudError::Manifest`] if the file cannot be read.
pub fn from_file(path: &Path) -> Result<Manifest, CloudError> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| CloudError::Manifest(format!("{}: {e}", path.display())))?;
    Ok(Manifest::new(path.display().to_string(), yaml))
}

/// Download a manifest.
///
/// # Errors
/// [`CloudError::NotFound`] on 404, [`CloudError::Api`] for other failures.
pub async fn fetch(http: &Client, url: &str) -> Result<Manifest, CloudError> {
    debug!(url = %url, "Fetching manifest");
    let response = http.get(url).send().await?;
    let status = response.status();
    let text = response.text().await?;
    if status.is_success() {
        Ok(Manifest::new(url, text))
    } else if status == StatusCode::NOT_FOUND {
        Err(CloudError::NotFound(url.to_string()))
    } else {
        Err(CloudError::Api {
            status: status.as_u16(),
            message: text,
        })
    }
}

/// Raw URL of `path` in `owner/repo` at `branch`.
#[must_use]
pub fn github_raw_url(base: &str, repo: &str, branch: &str, path: &str) -> String {
    format!(
        "{}/{}/{branch}/{}",
        base.trim_end_matches('/'),
        repo.trim_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Download `path` from the GitHub repository `owner/repo`, trying each of
/// `branches` until one has the file.
///
/// # Errors
/// [`CloudError::NotFound`] if no branch has the file.
pub async fn fetch_github(
    http: &Client,
    base: &str,
    repo: &str,
    branches: &[&str],
    path: &str,
) -> Result<Manifest, CloudError> {
    for branch in branches {
        let url = github_raw_url(base, repo, branch, path);
        match fetch(http, &url).await {
            Ok(manifest) => return Ok(manifest),
            Err(CloudError::NotFound(_)) => debug!(branch = %branch, "Manifest not on branch"),
            Err(e) => return Err(e),
        }
    }
    Err(CloudError::NotFound(format!(
        "{path} in {repo} (branches {})",
        branches.join(", ")
    )))
}
