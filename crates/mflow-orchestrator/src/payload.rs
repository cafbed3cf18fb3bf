//! Payload factory: builds dispatch messages from upstream outputs.
//!
//! This is the one place that branches on the stage being dispatched, so
//! adding a [`WorkerKind`] fails to compile until its payload is defined here.

use mflow_models::{
    AiPayload, AudioTrack, Job, StagePayload, SubtitlePayload, SubtitleTrack, Task, TaskOutput,
    ThumbnailPayload, TranscodePayload, WorkerKind,
};
use mflow_queue::TaskMessage;

/// Dispatch message for `task`: the job's original source plus whatever
/// completed upstream tasks produced.
pub fn build_task_message(job: &Job, task: &Task) -> TaskMessage {
    TaskMessage::new(job.id.clone(), task.id.clone(), job.source_url.clone())
        .with_payload(build_payload(job, task.worker_kind))
}

/// Stage payload for `kind` from the job's completed outputs.
pub fn build_payload(job: &Job, kind: WorkerKind) -> StagePayload {
    let upstream = Upstream::collect(job);
    match kind {
        WorkerKind::Thumbnail => StagePayload::Thumbnail(ThumbnailPayload {
            media_url: upstream.media_url,
        }),
        WorkerKind::Transcode => StagePayload::Transcode(TranscodePayload {
            audio_tracks: upstream.audio_tracks,
            subtitle_tracks: upstream.subtitle_tracks,
            poster_url: upstream.poster_url,
        }),
        WorkerKind::Subtitle => StagePayload::Subtitle(SubtitlePayload {
            media_url: upstream.media_url,
        }),
        WorkerKind::Ai => StagePayload::Ai(AiPayload {
            media_url: upstream.media_url,
            subtitle_tracks: upstream.subtitle_tracks,
        }),
    }
}

/// Everything completed tasks have produced so far.
#[derive(Default)]
struct Upstream {
    media_url: Option<String>,
    poster_url: Option<String>,
    audio_tracks: Vec<AudioTrack>,
    subtitle_tracks: Vec<SubtitleTrack>,
}

impl Upstream {
    fn collect(job: &Job) -> Self {
        let mut upstream = Self::default();
        for output in job.completed_outputs() {
            match output {
                TaskOutput::Transcode(o) => upstream.media_url = Some(o.output_url.clone()),
                TaskOutput::Subtitle(o) => upstream.subtitle_tracks.extend(o.tracks.iter().cloned()),
                TaskOutput::Ai(o) => upstream.audio_tracks.extend(o.dubbed_audio.iter().cloned()),
                TaskOutput::Thumbnail(o) => upstream.poster_url = Some(o.thumbnail_url.clone()),
            }
        }
        upstream
    }
}
