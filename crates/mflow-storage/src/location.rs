//! Source and artifact locations.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

use crate::error::{StorageError, StorageResult};

/// Where a file lives, parsed from the URL strings carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// `s3://bucket/key` or `r2://bucket/key`
    Object { bucket: String, key: String },
    /// Plain `http(s)://` URL
    Http(Url),
    /// `file://` URL or bare path
    File(PathBuf),
}

impl Location {
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StorageError::unsupported("empty location"));
        }

        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                return Ok(Location::File(PathBuf::from(raw)))
            }
            Err(e) => return Err(StorageError::unsupported(format!("{}: {}", raw, e))),
        };

        match url.scheme() {
            "s3" | "r2" => {
                let bucket = url
                    .host_str()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| StorageError::unsupported(format!("{}: missing bucket", raw)))?
                    .to_string();
                let key = url.path().trim_start_matches('/').to_string();
                if key.is_empty() {
                    return Err(StorageError::InvalidKey(raw.to_string()));
                }
                Ok(Location::Object { bucket, key })
            }
            "http" | "https" => Ok(Location::Http(url)),
            "file" => url
                .to_file_path()
                .map(Location::File)
                .map_err(|_| StorageError::unsupported(raw.to_string())),
            other => Err(StorageError::unsupported(format!(
                "{}: scheme '{}' is not supported",
                raw, other
            ))),
        }
    }

    /// Last path segment, used as the local file name.
    pub fn file_name(&self) -> Option<String> {
        let name = match self {
            Location::Object { key, .. } => key.rsplit('/').next().map(str::to_string),
            Location::Http(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(str::to_string),
            Location::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        };
        name.filter(|n| !n.is_empty() && n != "." && n != "..")
    }
}

impl FromStr for Location {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Object { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
            Location::Http(url) => write!(f, "{}", url),
            Location::File(path) => write!(f, "{}", path.display()),
        }
    }
}
