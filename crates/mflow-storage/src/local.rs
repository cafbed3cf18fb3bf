//! Local filesystem storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::error::{StorageError, StorageResult};
use crate::http::{download_client, download_to_file};
use crate::location::Location;
use crate::storage::{download_target, validate_key, Storage};

/// Storage rooted at a local directory. Artifacts are returned as
/// `file://` URLs; relative source paths resolve against the root.
#[derive(Clone)]
pub struct LocalStorage {
    root: PathBuf,
    http: Client,
}

impl LocalStorage {
    /// Create the root directory if needed and open storage on it.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self {
            root,
            http: download_client()?,
        })
    }

    /// Create from `LOCAL_STORAGE_ROOT` (default `./storage`).
    pub fn from_env() -> StorageResult<Self> {
        let root =
            std::env::var("LOCAL_STORAGE_ROOT").unwrap_or_else(|_| "./storage".to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an object key is stored at.
    pub fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        Ok(self.root.join(validate_key(key)?))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn download_file(&self, url: &str, dest_dir: &Path) -> StorageResult<PathBuf> {
        let location = Location::parse(url)?;
        let target = download_target(dest_dir, &location);
        tokio::fs::create_dir_all(dest_dir).await?;

        match &location {
            Location::File(path) => {
                let source = if path.is_absolute() {
                    path.clone()
                } else {
                    self.path_for(&path.to_string_lossy())?
                };
                if !tokio::fs::try_exists(&source).await? {
                    return Err(StorageError::not_found(source.display().to_string()));
                }
                tokio::fs::copy(&source, &target).await?;
            }
            Location::Http(url) => {
                download_to_file(&self.http, url, &target).await?;
            }
            Location::Object { .. } => {
                return Err(StorageError::unsupported(format!(
                    "{} requires object storage",
                    location
                )))
            }
        }

        debug!(source = %location, path = %target.display(), "Resolved source file");
        Ok(target)
    }

    async fn save_file(&self, local_path: &Path, key: &str) -> StorageResult<String> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &target)
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}: {}", local_path.display(), e)))?;

        let url = Url::from_file_path(&target)
            .map_err(|_| StorageError::InvalidKey(key.to_string()))?;
        info!("Saved {} to {}", local_path.display(), url);
        Ok(url.to_string())
    }
}
