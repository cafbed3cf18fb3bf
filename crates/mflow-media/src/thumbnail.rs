//! Thumbnail generation.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use mflow_models::{TaskOutput, ThumbnailOutput, WorkerKind};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;
use crate::probe::{probe_media, MediaInfo};
use crate::processor::{ProcessContext, ProcessInput, Processor, ProcessorOptions};

const THUMBNAIL_FILE: &str = "thumbnail.jpg";

/// Grabs a single scaled frame with ffmpeg.
#[derive(Debug, Default, Clone)]
pub struct ThumbnailProcessor {
    runner: FfmpegRunner,
}

impl ThumbnailProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Seek position: the configured offset, but never past the middle of short clips.
fn seek_position(info: &MediaInfo, options: &ProcessorOptions) -> f64 {
    if info.duration > 0.0 {
        options.thumbnail_offset_secs.min(info.duration / 2.0)
    } else {
        0.0
    }
}

/// Output height for a width-constrained scale, rounded to even like `scale=W:-2`.
fn scaled_height(info: &MediaInfo, width: u32) -> Option<u32> {
    if info.width == 0 || info.height == 0 {
        return None;
    }
    let exact = info.height as f64 * width as f64 / info.width as f64;
    Some(((exact / 2.0).round() as u32) * 2)
}

pub(crate) fn thumbnail_command(
    input: &Path,
    output: &Path,
    info: &MediaInfo,
    options: &ProcessorOptions,
) -> FfmpegCommand {
    FfmpegCommand::new(input, output)
        .seek(seek_position(info, options))
        .single_frame()
        .video_filter(format!("scale={}:-2", options.thumbnail_width))
        .output_args(["-q:v", "3"])
}

#[async_trait]
impl Processor for ThumbnailProcessor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Thumbnail
    }

    async fn process(&self, input: &ProcessInput, ctx: &ProcessContext) -> MediaResult<TaskOutput> {
        input.payload_for(WorkerKind::Thumbnail)?;

        let info = probe_media(&input.local_path).await?;
        ctx.progress.report(20.0);

        let output = ctx.output_dir.join(THUMBNAIL_FILE);
        let cmd = thumbnail_command(&input.local_path, &output, &info, &ctx.options);
        self.runner.run(&cmd).await?;
        ctx.progress.report(80.0);

        let thumbnail_url = ctx.artifacts.publish(&output).await?;
        info!(job_id = %input.job_id, url = %thumbnail_url, "Thumbnail generated");

        Ok(TaskOutput::Thumbnail(ThumbnailOutput {
            thumbnail_url,
            width: Some(ctx.options.thumbnail_width),
            height: scaled_height(&info, ctx.options.thumbnail_width),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(duration: f64, width: u32, height: u32) -> MediaInfo {
        MediaInfo {
            duration,
            width,
            height,
            has_audio: true,
        }
    }

    #[test]
    fn test_seek_position() {
        let options = ProcessorOptions::default();
        assert_eq!(seek_position(&info(60.0, 1920, 1080), &options), 1.0);
        assert_eq!(seek_position(&info(1.0, 1920, 1080), &options), 0.5);
        assert_eq!(seek_position(&info(0.0, 1920, 1080), &options), 0.0);
    }

    #[test]
    fn test_scaled_height() {
        assert_eq!(scaled_height(&info(1.0, 1920, 1080), 480), Some(270));
        assert_eq!(scaled_height(&info(1.0, 1080, 1920), 480), Some(854));
        assert_eq!(scaled_height(&info(1.0, 0, 0), 480), None);
    }

    #[test]
    fn test_thumbnail_command() {
        let options = ProcessorOptions::default();
        let cmd = thumbnail_command(
            Path::new("/work/in.mp4"),
            Path::new("/work/out/thumbnail.jpg"),
            &info(60.0, 1920, 1080),
            &options,
        );
        let args = cmd.build_args();
        assert!(args.contains(&"scale=480:-2".to_string()));
        assert!(args.contains(&"-frames:v".to_string()));
        assert_eq!(args.last().unwrap(), "/work/out/thumbnail.jpg");
    }
}
