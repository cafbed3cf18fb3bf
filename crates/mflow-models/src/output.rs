//! Stage outputs, keyed by worker kind.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::WorkerKind;

/// A subtitle track produced by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleTrack {
    /// BCP 47 language tag
    pub language: String,
    /// Location of the subtitle file (WebVTT)
    pub url: String,
}

/// An additional audio track (e.g. a dubbed language).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrack {
    /// BCP 47 language tag
    pub language: String,
    /// Location of the audio file
    pub url: String,
}

/// One encoded rendition of the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rendition {
    /// Output height in pixels
    pub height: u32,
    /// Location of the encoded file
    pub url: String,
    /// Average bitrate of the encoded file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailOutput {
    pub thumbnail_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeOutput {
    /// Primary (highest) rendition
    pub output_url: String,
    #[serde(default)]
    pub renditions: Vec<Rendition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleOutput {
    #[serde(default)]
    pub tracks: Vec<SubtitleTrack>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AiOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dubbed_audio: Vec<AudioTrack>,
}

/// Output of a completed task, discriminated by worker kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    Thumbnail(ThumbnailOutput),
    Transcode(TranscodeOutput),
    Subtitle(SubtitleOutput),
    Ai(AiOutput),
}

impl TaskOutput {
    /// The worker kind that produces this variant.
    pub fn worker_kind(&self) -> WorkerKind {
        match self {
            TaskOutput::Thumbnail(_) => WorkerKind::Thumbnail,
            TaskOutput::Transcode(_) => WorkerKind::Transcode,
            TaskOutput::Subtitle(_) => WorkerKind::Subtitle,
            TaskOutput::Ai(_) => WorkerKind::Ai,
        }
    }

    /// URL that represents this output as a job result, if any.
    pub fn primary_url(&self) -> Option<&str> {
        match self {
            TaskOutput::Transcode(o) => Some(&o.output_url),
            TaskOutput::Thumbnail(o) => Some(&o.thumbnail_url),
            TaskOutput::Subtitle(_) | TaskOutput::Ai(_) => None,
        }
    }
}
