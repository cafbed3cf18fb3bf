//! The storage contract consumed by workers.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::location::Location;

/// File storage used to fetch task inputs and publish task artifacts.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch `url` into `dest_dir` and return the local path.
    async fn download_file(&self, url: &str, dest_dir: &Path) -> StorageResult<PathBuf>;

    /// Publish a local file under `key` and return its final URL.
    async fn save_file(&self, local_path: &Path, key: &str) -> StorageResult<String>;
}

/// Guess a content type from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("m4a") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        Some("aac") => "audio/aac",
        Some("wav") => "audio/wav",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("vtt") => "text/vtt",
        Some("srt") => "application/x-subrip",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Reject keys that would escape the storage root.
pub(crate) fn validate_key(key: &str) -> StorageResult<&str> {
    let key = key.trim_start_matches('/');
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if key.is_empty() || escapes {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(key)
}

/// Local path a download of `location` is written to.
pub(crate) fn download_target(dest_dir: &Path, location: &Location) -> PathBuf {
    dest_dir.join(location.file_name().unwrap_or_else(|| "source".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a/out.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("thumb.jpg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("en.vtt")), "text/vtt");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn test_validate_key() {
        assert_eq!(validate_key("/jobs/j1/thumb.jpg").unwrap(), "jobs/j1/thumb.jpg");
        assert!(validate_key("").is_err());
        assert!(validate_key("jobs/../../etc/passwd").is_err());
        assert!(validate_key("./a").is_err());
    }

    #[test]
    fn test_download_target() {
        let dir = Path::new("/work/t1");
        let loc = Location::parse("s3://b/uploads/in.mp4").unwrap();
        assert_eq!(download_target(dir, &loc), dir.join("in.mp4"));

        let loc = Location::parse("https://cdn.example.com/").unwrap();
        assert_eq!(download_target(dir, &loc), dir.join("source"));
    }
}
