//! Model repositories in Cloud Storage.
//!
//! Inference servers such as Triton read their model repository from a
//! bucket. [`GcsModelRepo`] makes sure the bucket exists, optionally empties
//! it, uploads a local repository tree and optionally removes the uploaded
//! model directories afterwards.
//!
//! ```text
//! repo_dir/                      gs://bucket/
//! ├── triton/config.pbtxt   ──►  triton/config.pbtxt
//! └── triton/1/model.onnx   ──►  triton/1/model.onnx
//! ```

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::CloudError;
use crate::gke::{ApiErrorResponse, TokenProvider, TokenSource};

/// Root of the Cloud Storage JSON API.
pub const DEFAULT_STORAGE_URL: &str = "https://storage.googleapis.com";

/// Uploads of large model files take a while.
const UPLOAD_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<StoredObject>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoredObject {
    name: String,
}

/// What [`GcsModelRepo::export_repo`] does around the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    /// Delete every object in the bucket before uploading.
    pub start_fresh: bool,
    /// Remove the uploaded model directories from `repo_dir` afterwards.
    pub clear: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            start_fresh: true,
            clear: true,
        }
    }
}

/// A bucket holding an inference model repository.
pub struct GcsModelRepo {
    http: Client,
    base_url: String,
    project: String,
    bucket: String,
    tokens: TokenProvider,
    bucket_ready: OnceCell<()>,
}

impl GcsModelRepo {
    /// Repository in `bucket`, created in `project` if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        project: impl Into<String>,
        bucket: impl Into<String>,
        tokens: TokenSource,
    ) -> Result<Self, CloudError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            tokens: TokenProvider::new(tokens, http.clone()),
            http,
            base_url: DEFAULT_STORAGE_URL.to_string(),
            project: project.into(),
            bucket: bucket.into(),
            bucket_ready: OnceCell::new(),
        })
    }

    /// Point at another API root, e.g. a mock server.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    /// `base_url` plus percent-encoded path segments.
    fn url(&self, segments: &[&str]) -> Result<Url, CloudError> {
        let invalid = || CloudError::Config(format!("invalid storage URL: {}", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, CloudError> {
        let token = self.tokens.token().await?;
        let response = request.bearer_auth(token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        Ok(response)
    }

    /// Turn a non-success response into an error.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorResponse>(&text)
            .map(|e| e.error.message)
            .unwrap_or(text);
        Err(match status {
            StatusCode::NOT_FOUND => CloudError::NotFound(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Auth(message),
            _ => CloudError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    /// Get the bucket, creating it if it does not exist. Only checked once
    /// per repository.
    ///
    /// # Errors
    /// API errors other than "not found" on lookup and "already exists" on
    /// creation.
    pub async fn ensure_bucket(&self) -> Result<(), CloudError> {
        self.bucket_ready
            .get_or_try_init(|| self.get_or_create_bucket())
            .await?;
        Ok(())
    }

    async fn get_or_create_bucket(&self) -> Result<(), CloudError> {
        let url = self.url(&["storage", "v1", "b", &self.bucket])?;
        let response = self.send(self.http.request(Method::GET, url)).await?;
        match Self::check(response).await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "Bucket exists");
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut url = self.url(&["storage", "v1", "b"])?;
        url.query_pairs_mut().append_pair("project", &self.project);
        let request = self
            .http
            .request(Method::POST, url)
            .json(&json!({ "name": self.bucket }));
        let response = self.send(request).await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(bucket = %self.bucket, "Bucket created concurrently");
            return Ok(());
        }
        Self::check(response).await?;
        info!(bucket = %self.bucket, project = %self.project, "Created bucket");
        Ok(())
    }

    /// Names of every object in the bucket.
    ///
    /// # Errors
    /// API errors.
    pub async fn list_objects(&self) -> Result<Vec<String>, CloudError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }
            let response = self.send(self.http.request(Method::GET, url)).await?;
            let page: ObjectList = Self::check(response).await?.json().await?;
            names.extend(page.items.into_iter().map(|o| o.name));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(names),
            }
        }
    }

    /// Delete one object; a missing object counts as deleted.
    ///
    /// # Errors
    /// API errors other than "not found".
    pub async fn delete_object(&self, name: &str) -> Result<(), CloudError> {
        let url = self.url(&["storage", "v1", "b", &self.bucket, "o", name])?;
        let response = self.send(self.http.request(Method::DELETE, url)).await?;
        match Self::check(response).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Upload the file at `path` as object `name`.
    ///
    /// # Errors
    /// I/O errors reading the file, API errors.
    pub async fn upload_file(&self, name: &str, path: &Path) -> Result<(), CloudError> {
        let body = tokio::fs::read(path).await?;
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name);
        let request = self
            .http
            .request(Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        Self::check(self.send(request).await?).await?;
        Ok(())
    }

    /// Copy the model repository at `repo_dir` into the bucket.
    ///
    /// Returns the uploaded object names in upload order.
    ///
    /// # Errors
    /// I/O errors walking or clearing `repo_dir`, API errors.
    pub async fn export_repo(
        &self,
        repo_dir: &Path,
        options: ExportOptions,
    ) -> Result<Vec<String>, CloudError> {
        self.ensure_bucket().await?;

        if options.start_fresh {
            let existing = self.list_objects().await?;
            info!(bucket = %self.bucket, objects = existing.len(), "Emptying bucket");
            for name in existing {
                self.delete_object(&name).await?;
            }
        }

        let mut uploaded = Vec::new();
        for path in repo_files(repo_dir)? {
            let Some(name) = blob_name(repo_dir, &path) else {
                warn!(path = %path.display(), "Skipping file outside the repository");
                continue;
            };
            info!(path = %path.display(), object = %name, "Copying");
            self.upload_file(&name, &path).await?;
            uploaded.push(name);
        }

        if options.clear {
            for dir in model_dirs(repo_dir)? {
                info!(model = %dir.display(), "Removing model");
                tokio::fs::remove_dir_all(&dir).await?;
            }
        }
        Ok(uploaded)
    }
}

/// Every regular file below `dir`, in a stable order.
fn repo_files(dir: &Path) -> Result<Vec<PathBuf>, CloudError> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Top-level directories of the repository, one per model.
fn model_dirs(dir: &Path) -> Result<Vec<PathBuf>, CloudError> {
    let mut dirs = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

/// Object name of `path` relative to `root`, always `/`-separated.
#[must_use]
pub fn blob_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (!parts.is_empty()).then(|| parts.join("/"))
}
