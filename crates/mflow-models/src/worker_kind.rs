//! The closed set of worker kinds.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A pipeline stage type, served by one worker deployment.
///
/// Every `match` on this enum is exhaustive, so adding a kind forces each
/// payload, output and processor site to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Poster frame extraction
    Thumbnail,
    /// Rendition encoding and track muxing
    Transcode,
    /// Speech-to-text subtitle generation
    Subtitle,
    /// AI enrichment (summary, tags, dubbed audio)
    Ai,
}

impl WorkerKind {
    /// All kinds, in declaration order.
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::Thumbnail,
        WorkerKind::Transcode,
        WorkerKind::Subtitle,
        WorkerKind::Ai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Thumbnail => "thumbnail",
            WorkerKind::Transcode => "transcode",
            WorkerKind::Subtitle => "subtitle",
            WorkerKind::Ai => "ai",
        }
    }

    /// Name of the dispatch channel this kind consumes.
    pub fn channel_name(&self) -> &'static str {
        match self {
            WorkerKind::Thumbnail => "thumbnail_tasks",
            WorkerKind::Transcode => "transcode_tasks",
            WorkerKind::Subtitle => "subtitle_tasks",
            WorkerKind::Ai => "ai_tasks",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known worker kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown worker kind: {0}")]
pub struct UnknownWorkerKind(pub String);

impl FromStr for WorkerKind {
    type Err = UnknownWorkerKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thumbnail" => Ok(WorkerKind::Thumbnail),
            "transcode" => Ok(WorkerKind::Transcode),
            "subtitle" => Ok(WorkerKind::Subtitle),
            "ai" => Ok(WorkerKind::Ai),
            other => Err(UnknownWorkerKind(other.to_string())),
        }
    }
}
