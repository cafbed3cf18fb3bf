//! The processor contract.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mflow_models::{JobId, StagePayload, TaskId, TaskOutput, WorkerKind};
use mflow_storage::Storage;

use crate::error::{MediaError, MediaResult};
use crate::progress::ProgressReporter;

/// One unit of work for a processor.
#[derive(Debug, Clone)]
pub struct ProcessInput {
    pub job_id: JobId,
    pub task_id: TaskId,
    /// Original upload URL
    pub source_url: String,
    /// URL the local input was fetched from (an upstream output or the source)
    pub input_url: String,
    /// Local copy of `input_url`
    pub local_path: PathBuf,
    pub payload: Option<StagePayload>,
}

impl ProcessInput {
    /// Payload for `kind`. A payload for any other kind is rejected; none at
    /// all means the stage runs on the source alone.
    pub fn payload_for(&self, kind: WorkerKind) -> MediaResult<Option<&StagePayload>> {
        match &self.payload {
            Some(p) if p.worker_kind() != kind => Err(MediaError::PayloadMismatch {
                processor: kind,
                found: p.worker_kind(),
            }),
            other => Ok(other.as_ref()),
        }
    }
}

/// Tunables shared by the built-in processors.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Thumbnail width in pixels; height keeps the aspect ratio
    pub thumbnail_width: u32,
    /// Seek position of the thumbnail frame, capped at half the duration
    pub thumbnail_offset_secs: f64,
    /// Rendition heights to produce, largest first
    pub rendition_heights: Vec<u32>,
    pub video_preset: String,
    pub video_crf: u8,
    pub audio_bitrate: String,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            thumbnail_width: 480,
            thumbnail_offset_secs: 1.0,
            rendition_heights: vec![1080, 720, 480],
            video_preset: "veryfast".to_string(),
            video_crf: 23,
            audio_bitrate: "128k".to_string(),
        }
    }
}

impl ProcessorOptions {
    /// Create options from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut heights: Vec<u32> = std::env::var("TRANSCODE_HEIGHTS")
            .ok()
            .map(|s| s.split(',').filter_map(|h| h.trim().parse().ok()).collect())
            .filter(|h: &Vec<u32>| !h.is_empty())
            .unwrap_or(defaults.rendition_heights);
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.dedup();

        Self {
            thumbnail_width: std::env::var("THUMBNAIL_WIDTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.thumbnail_width),
            thumbnail_offset_secs: std::env::var("THUMBNAIL_OFFSET_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.thumbnail_offset_secs),
            rendition_heights: heights,
            video_preset: std::env::var("TRANSCODE_PRESET").unwrap_or(defaults.video_preset),
            video_crf: std::env::var("TRANSCODE_CRF")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.video_crf),
            audio_bitrate: defaults.audio_bitrate,
        }
    }
}

/// Publishes task artifacts through `Storage` under
/// `jobs/<job id>/<kind>/`.
#[derive(Clone)]
pub struct ArtifactPublisher {
    storage: Arc<dyn Storage>,
    prefix: String,
}

impl ArtifactPublisher {
    pub fn new(storage: Arc<dyn Storage>, job_id: &JobId, kind: WorkerKind) -> Self {
        Self {
            storage,
            prefix: format!("jobs/{}/{}", job_id, kind),
        }
    }

    pub fn key_for(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Upload `local` under its own file name and return the final URL.
    pub async fn publish(&self, local: &Path) -> MediaResult<String> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MediaError::FileNotFound(local.to_path_buf()))?;
        let url = self.storage.save_file(local, &self.key_for(&name)).await?;
        debug!(artifact = %url, "Published artifact");
        Ok(url)
    }

    /// Fetch an auxiliary input (e.g. an upstream track) into `dir`.
    pub async fn fetch(&self, url: &str, dir: &Path) -> MediaResult<PathBuf> {
        Ok(self.storage.download_file(url, dir).await?)
    }
}

/// Everything a processor may use besides its input.
#[derive(Clone)]
pub struct ProcessContext {
    pub output_dir: PathBuf,
    pub progress: ProgressReporter,
    pub artifacts: ArtifactPublisher,
    pub options: Arc<ProcessorOptions>,
}

/// A stage implementation: consumes an input, reports progress, returns
/// the stage output.
#[async_trait]
pub trait Processor: Send + Sync {
    fn kind(&self) -> WorkerKind;

    async fn process(&self, input: &ProcessInput, ctx: &ProcessContext) -> MediaResult<TaskOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mflow_models::{SubtitlePayload, TranscodePayload};
    use serial_test::serial;

    fn input(payload: Option<StagePayload>) -> ProcessInput {
        ProcessInput {
            job_id: JobId::from_string("j1"),
            task_id: TaskId::from_string("t1"),
            source_url: "s3://in/a.mp4".into(),
            input_url: "s3://in/a.mp4".into(),
            local_path: PathBuf::from("/work/a.mp4"),
            payload,
        }
    }

    #[test]
    fn test_payload_for_checks_kind() {
        let transcode = input(Some(StagePayload::Transcode(TranscodePayload::default())));
        assert!(transcode.payload_for(WorkerKind::Transcode).unwrap().is_some());
        assert!(matches!(
            transcode.payload_for(WorkerKind::Subtitle),
            Err(MediaError::PayloadMismatch { .. })
        ));

        let none = input(None);
        assert!(none.payload_for(WorkerKind::Thumbnail).unwrap().is_none());

        let subtitle = input(Some(StagePayload::Subtitle(SubtitlePayload::default())));
        assert!(subtitle.payload_for(WorkerKind::Subtitle).is_ok());
    }

    #[test]
    #[serial]
    fn test_options_from_env() {
        std::env::set_var("TRANSCODE_HEIGHTS", "480, 1080,720,bogus,720");
        std::env::set_var("THUMBNAIL_WIDTH", "320");
        let options = ProcessorOptions::from_env();
        std::env::remove_var("TRANSCODE_HEIGHTS");
        std::env::remove_var("THUMBNAIL_WIDTH");

        assert_eq!(options.rendition_heights, vec![1080, 720, 480]);
        assert_eq!(options.thumbnail_width, 320);
        assert_eq!(options.video_crf, 23);
    }
}
