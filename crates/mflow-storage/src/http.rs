//! Streaming HTTP(S) downloads.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::error::{StorageError, StorageResult};

/// HTTP client for source downloads. No overall timeout: media files can be
/// large, only connecting and stalls are bounded.
pub fn download_client() -> StorageResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(60))
        .user_agent(concat!("mflow-storage/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(StorageError::Http)
}

/// Stream `url` into `path`, returning the number of bytes written.
pub async fn download_to_file(client: &Client, url: &Url, path: &Path) -> StorageResult<u64> {
    let response = client.get(url.clone()).send().await?;
    match response.status() {
        status if status.is_success() => {}
        StatusCode::NOT_FOUND => return Err(StorageError::not_found(url.as_str())),
        status => {
            return Err(StorageError::download_failed(format!(
                "{} returned {}",
                url, status
            )))
        }
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!(url = %url, path = %path.display(), bytes = written, "Downloaded over HTTP");
    Ok(written)
}
