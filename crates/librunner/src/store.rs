use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage rejected object: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Durable object storage that file contents are replicated into.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Mirrors objects into a local directory, one file per key.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        for component in Path::new(key).components() {
            match component {
                Component::Normal(seg) => path.push(seg),
                _ => return Err(StoreError::Permanent(format!("invalid object key: {key}"))),
            }
        }
        if path == self.root {
            return Err(StoreError::Permanent("empty object key".to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let transient = |e: std::io::Error| StoreError::Transient(format!("{}: {e}", path.display()));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(transient)?;
        }
        let tmp = path.with_extension(format!("{}.part", uuid::Uuid::new_v4().simple()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(transient(e));
        }
        Ok(())
    }
}

/// Stores objects with `PUT {endpoint}/{key}` against an S3-style HTTP
/// endpoint. Authentication beyond an optional bearer token is left to the
/// endpoint (e.g. a signing proxy).
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    bearer_token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| StoreError::Permanent(format!("invalid endpoint {endpoint}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(StoreError::Permanent(format!(
                "endpoint cannot carry object keys: {endpoint}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Permanent(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            bearer_token,
        })
    }

    pub fn url_for(&self, key: &str) -> Result<reqwest::Url, StoreError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| StoreError::Permanent("endpoint cannot be a base".to_string()))?;
            segments.pop_if_empty();
            segments.extend(key.split('/'));
        }
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let url = self.url_for(key)?;
        let mut request = self.client.put(url).body(bytes.to_vec());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(StoreError::Transient(format!("{key}: http {status}")))
        } else {
            Err(StoreError::Permanent(format!("{key}: http {status}")))
        }
    }
}
