//! H.264/AAC transcoding into a rendition ladder.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use mflow_models::{Rendition, StagePayload, TaskOutput, TranscodeOutput, TranscodePayload, WorkerKind};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::{probe_media, MediaInfo};
use crate::processor::{ProcessContext, ProcessInput, Processor, ProcessorOptions};

/// Share of the progress range spent before encoding starts.
const PREPARE_PERCENT: f64 = 5.0;
/// Share of the progress range spent encoding; the rest is publishing.
const ENCODE_PERCENT: f64 = 90.0;

/// Local copies of upstream tracks to mux into every rendition.
#[derive(Debug, Default, Clone)]
pub(crate) struct ExtraTracks {
    pub audio: Vec<(String, PathBuf)>,
    pub subtitles: Vec<(String, PathBuf)>,
    /// Cover art, attached as a second video stream
    pub poster: Option<PathBuf>,
}

/// Encodes the source into each configured height not above the source's,
/// muxing dubbed audio and soft subtitles from upstream stages.
#[derive(Debug, Default, Clone)]
pub struct TranscodeProcessor {
    runner: FfmpegRunner,
}

impl TranscodeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fetch_tracks(
        &self,
        payload: &TranscodePayload,
        ctx: &ProcessContext,
    ) -> MediaResult<ExtraTracks> {
        let inputs = ctx.output_dir.join("inputs");
        let mut tracks = ExtraTracks::default();

        for (i, track) in payload.audio_tracks.iter().enumerate() {
            let dir = inputs.join(format!("audio-{}", i));
            let path = ctx.artifacts.fetch(&track.url, &dir).await?;
            tracks.audio.push((track.language.clone(), path));
        }
        for (i, track) in payload.subtitle_tracks.iter().enumerate() {
            let dir = inputs.join(format!("subtitle-{}", i));
            let path = ctx.artifacts.fetch(&track.url, &dir).await?;
            tracks.subtitles.push((track.language.clone(), path));
        }
        if let Some(url) = &payload.poster_url {
            tracks.poster = Some(ctx.artifacts.fetch(url, &inputs.join("poster")).await?);
        }
        Ok(tracks)
    }
}

/// Heights to encode, largest first. Never upscales; a source smaller than
/// every configured height is encoded at its own height.
pub(crate) fn rendition_plan(source_height: u32, heights: &[u32]) -> Vec<u32> {
    if source_height == 0 {
        return heights.to_vec();
    }
    let plan: Vec<u32> = heights
        .iter()
        .copied()
        .filter(|h| *h <= source_height)
        .collect();
    if plan.is_empty() {
        // Even dimensions are required by yuv420p
        vec![source_height - source_height % 2]
    } else {
        plan
    }
}

pub(crate) fn transcode_command(
    input: &Path,
    output: &Path,
    height: u32,
    info: &MediaInfo,
    tracks: &ExtraTracks,
    options: &ProcessorOptions,
) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(input, output).map("0:v:0");
    for (_, path) in tracks.audio.iter().chain(tracks.subtitles.iter()) {
        cmd = cmd.extra_input(path);
    }
    if let Some(poster) = &tracks.poster {
        let index = 1 + tracks.audio.len() + tracks.subtitles.len();
        cmd = cmd
            .extra_input(poster)
            .map(format!("{}:v:0", index));
    }

    let mut audio_index = 0;
    if info.has_audio {
        cmd = cmd.map("0:a:0");
        audio_index += 1;
    }
    for (i, (language, _)) in tracks.audio.iter().enumerate() {
        cmd = cmd
            .map(format!("{}:a:0", 1 + i))
            .stream_metadata(&format!("s:a:{}", audio_index), "language", language);
        audio_index += 1;
    }
    for (i, (language, _)) in tracks.subtitles.iter().enumerate() {
        cmd = cmd
            .map(format!("{}:s:0", 1 + tracks.audio.len() + i))
            .stream_metadata(&format!("s:s:{}", i), "language", language);
    }

    // Scoped to the main video stream so an attached poster is left as is
    cmd = cmd
        .output_args(["-filter:v:0".to_string(), format!("scale=-2:{}", height)])
        .video_codec("libx264")
        .preset(options.video_preset.clone())
        .crf(options.video_crf)
        .output_args(["-pix_fmt:v:0", "yuv420p"]);
    if audio_index > 0 {
        cmd = cmd
            .audio_codec("aac")
            .audio_bitrate(options.audio_bitrate.clone());
    }
    if !tracks.subtitles.is_empty() {
        cmd = cmd.subtitle_codec("mov_text");
    }
    if tracks.poster.is_some() {
        cmd = cmd.output_args(["-c:v:1", "copy", "-disposition:v:1", "attached_pic"]);
    }
    cmd.output_args(["-movflags", "+faststart"])
}

fn bitrate_kbps(size_bytes: u64, duration_secs: f64) -> Option<u32> {
    if duration_secs <= 0.0 {
        return None;
    }
    Some((size_bytes as f64 * 8.0 / duration_secs / 1000.0).round() as u32)
}

#[async_trait]
impl Processor for TranscodeProcessor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Transcode
    }

    async fn process(&self, input: &ProcessInput, ctx: &ProcessContext) -> MediaResult<TaskOutput> {
        let payload = match input.payload_for(WorkerKind::Transcode)? {
            Some(StagePayload::Transcode(p)) => p.clone(),
            _ => TranscodePayload::default(),
        };

        let info = probe_media(&input.local_path).await?;
        let tracks = self.fetch_tracks(&payload, ctx).await?;
        ctx.progress.report(PREPARE_PERCENT);

        let plan = rendition_plan(info.height, &ctx.options.rendition_heights);
        let span = ENCODE_PERCENT / plan.len() as f64;
        let total_ms = info.duration_ms();
        let mut renditions = Vec::with_capacity(plan.len());

        for (i, height) in plan.iter().copied().enumerate() {
            let output = ctx.output_dir.join(format!("{}p.mp4", height));
            let cmd = transcode_command(
                &input.local_path,
                &output,
                height,
                &info,
                &tracks,
                &ctx.options,
            );

            let reporter = ctx.progress.clone();
            let base = PREPARE_PERCENT + span * i as f64;
            self.runner
                .run_with_progress(&cmd, move |p| {
                    reporter.report(base + span * p.percentage(total_ms) / 100.0)
                })
                .await?;

            let size = tokio::fs::metadata(&output).await?.len();
            let url = ctx.artifacts.publish(&output).await?;
            info!(job_id = %input.job_id, height, url = %url, "Rendition encoded");

            renditions.push(Rendition {
                height,
                url,
                bitrate_kbps: bitrate_kbps(size, info.duration),
            });
        }

        let output_url = renditions
            .first()
            .map(|r| r.url.clone())
            .ok_or_else(|| MediaError::internal("no renditions were configured"))?;

        Ok(TaskOutput::Transcode(TranscodeOutput {
            output_url,
            renditions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(height: u32, has_audio: bool) -> MediaInfo {
        MediaInfo {
            duration: 10.0,
            width: height * 16 / 9,
            height,
            has_audio,
        }
    }

    fn position_of(args: &[String], value: &str) -> usize {
        args.iter()
            .position(|a| a == value)
            .unwrap_or_else(|| panic!("{} not in {:?}", value, args))
    }

    #[test]
    fn test_rendition_plan_never_upscales() {
        let heights = [1080, 720, 480];
        assert_eq!(rendition_plan(2160, &heights), vec![1080, 720, 480]);
        assert_eq!(rendition_plan(720, &heights), vec![720, 480]);
        assert_eq!(rendition_plan(361, &heights), vec![360]);
        assert_eq!(rendition_plan(0, &heights), vec![1080, 720, 480]);
    }

    #[test]
    fn test_plain_transcode_command() {
        let cmd = transcode_command(
            Path::new("in.mp4"),
            Path::new("720p.mp4"),
            720,
            &info(1080, true),
            &ExtraTracks::default(),
            &ProcessorOptions::default(),
        );
        let args = cmd.build_args();

        assert!(args.contains(&"scale=-2:720".to_string()));
        assert!(args.contains(&"0:a:0".to_string()));
        assert!(args.contains(&"aac".to_string()));
        assert!(!args.contains(&"mov_text".to_string()));
    }

    #[test]
    fn test_muxes_extra_tracks_with_languages() {
        let tracks = ExtraTracks {
            poster: None,
            audio: vec![("es".into(), PathBuf::from("dub-es.aac"))],
            subtitles: vec![
                ("en".into(), PathBuf::from("en.vtt")),
                ("fr".into(), PathBuf::from("fr.vtt")),
            ],
        };
        let cmd = transcode_command(
            Path::new("in.mp4"),
            Path::new("720p.mp4"),
            720,
            &info(720, true),
            &tracks,
            &ProcessorOptions::default(),
        );
        let args = cmd.build_args();

        // Source audio keeps index 0, the dub is the second audio stream
        let dub = position_of(&args, "-metadata:s:a:1");
        assert_eq!(args[dub + 1], "language=es");
        assert!(args.contains(&"1:a:0".to_string()));
        assert!(args.contains(&"2:s:0".to_string()));
        assert!(args.contains(&"3:s:0".to_string()));
        let fr = position_of(&args, "-metadata:s:s:1");
        assert_eq!(args[fr + 1], "language=fr");
        assert!(args.contains(&"mov_text".to_string()));
    }

    #[test]
    fn test_poster_is_attached_picture() {
        let tracks = ExtraTracks {
            audio: vec![],
            subtitles: vec![("en".into(), PathBuf::from("en.vtt"))],
            poster: Some(PathBuf::from("thumbnail.jpg")),
        };
        let cmd = transcode_command(
            Path::new("in.mp4"),
            Path::new("720p.mp4"),
            720,
            &info(720, true),
            &tracks,
            &ProcessorOptions::default(),
        );
        let args = cmd.build_args();

        assert!(args.contains(&"2:v:0".to_string()));
        let disposition = position_of(&args, "-disposition:v:1");
        assert_eq!(args[disposition + 1], "attached_pic");
        let filter = position_of(&args, "-filter:v:0");
        assert_eq!(args[filter + 1], "scale=-2:720");
    }

    #[test]
    fn test_silent_source_without_tracks_has_no_audio_codec() {
        let cmd = transcode_command(
            Path::new("in.mp4"),
            Path::new("480p.mp4"),
            480,
            &info(480, false),
            &ExtraTracks::default(),
            &ProcessorOptions::default(),
        );
        assert!(!cmd.build_args().contains(&"-c:a".to_string()));
    }

    #[test]
    fn test_bitrate_kbps() {
        assert_eq!(bitrate_kbps(1_250_000, 10.0), Some(1000));
        assert_eq!(bitrate_kbps(1_000, 0.0), None);
    }
}
