//! Stage-specific dispatch payloads.
//!
//! A payload carries what upstream stages produced so a stage's input is the
//! raw source plus everything before it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{AudioTrack, SubtitleTrack, WorkerKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailPayload {
    /// Transcoded media to grab the frame from instead of the raw source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TranscodePayload {
    /// Extra audio tracks to mux (e.g. dubbed audio from the AI stage)
    #[serde(default)]
    pub audio_tracks: Vec<AudioTrack>,
    /// Subtitle tracks to mux as soft subtitles
    #[serde(default)]
    pub subtitle_tracks: Vec<SubtitleTrack>,
    /// Thumbnail to embed as cover art
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubtitlePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AiPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Transcripts available for summarisation and dubbing
    #[serde(default)]
    pub subtitle_tracks: Vec<SubtitleTrack>,
}

/// Stage-specific body attached to a dispatch message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Thumbnail(ThumbnailPayload),
    Transcode(TranscodePayload),
    Subtitle(SubtitlePayload),
    Ai(AiPayload),
}

impl StagePayload {
    pub fn worker_kind(&self) -> WorkerKind {
        match self {
            StagePayload::Thumbnail(_) => WorkerKind::Thumbnail,
            StagePayload::Transcode(_) => WorkerKind::Transcode,
            StagePayload::Subtitle(_) => WorkerKind::Subtitle,
            StagePayload::Ai(_) => WorkerKind::Ai,
        }
    }

    /// Preferred media input, when an upstream stage produced one.
    pub fn media_url(&self) -> Option<&str> {
        match self {
            StagePayload::Thumbnail(p) => p.media_url.as_deref(),
            StagePayload::Subtitle(p) => p.media_url.as_deref(),
            StagePayload::Ai(p) => p.media_url.as_deref(),
            StagePayload::Transcode(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcode_payload_wire_shape() {
        let payload = StagePayload::Transcode(TranscodePayload {
            audio_tracks: vec![AudioTrack {
                language: "es".into(),
                url: "s3://out/m1/dub-es.aac".into(),
            }],
            subtitle_tracks: vec![],
            poster_url: None,
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "transcode");
        assert_eq!(json["audioTracks"][0]["language"], "es");

        let back: StagePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_media_url() {
        let payload = StagePayload::Ai(AiPayload {
            media_url: Some("s3://out/720.mp4".into()),
            subtitle_tracks: vec![],
        });
        assert_eq!(payload.media_url(), Some("s3://out/720.mp4"));
        assert_eq!(payload.worker_kind(), WorkerKind::Ai);
    }
}
