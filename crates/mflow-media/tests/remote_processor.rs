//! RemoteProcessor against a mocked inference service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mflow_media::{
    ArtifactPublisher, MediaError, ProcessContext, ProcessInput, Processor, ProcessorOptions,
    ProgressReporter, RemoteProcessor, RemoteProcessorConfig,
};
use mflow_models::{
    JobId, StagePayload, SubtitlePayload, TaskId, TaskOutput, TranscodePayload, WorkerKind,
};
use mflow_storage::LocalStorage;

fn config(server: &MockServer) -> RemoteProcessorConfig {
    RemoteProcessorConfig {
        base_url: server.uri(),
        timeout: Duration::from_secs(5),
        max_retries: 1,
        api_key: Some("secret".into()),
    }
}

fn input(payload: Option<StagePayload>) -> ProcessInput {
    ProcessInput {
        job_id: JobId::from_string("job-1"),
        task_id: TaskId::from_string("task-1"),
        source_url: "s3://in/m1.mp4".into(),
        input_url: "s3://out/jobs/job-1/transcode/720p.mp4".into(),
        local_path: PathBuf::from("/work/720p.mp4"),
        payload,
    }
}

fn context(dir: &tempfile::TempDir, kind: WorkerKind) -> (ProcessContext, mflow_media::ProgressReceiver) {
    let storage = Arc::new(LocalStorage::new(dir.path().join("storage")).unwrap());
    let (progress, receiver) = ProgressReporter::channel();
    let ctx = ProcessContext {
        output_dir: dir.path().join("out"),
        progress,
        artifacts: ArtifactPublisher::new(storage, &JobId::from_string("job-1"), kind),
        options: Arc::new(ProcessorOptions::default()),
    };
    (ctx, receiver)
}

#[tokio::test]
async fn test_subtitle_request_and_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/subtitle"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "jobId": "job-1",
            "taskId": "task-1",
            "mediaUrl": "s3://out/jobs/job-1/transcode/720p.mp4",
            "sourceUrl": "s3://in/m1.mp4",
            "payload": {"kind": "subtitle", "mediaUrl": "s3://out/jobs/job-1/transcode/720p.mp4"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tracks": [{"language": "en", "url": "s3://out/en.vtt"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (ctx, receiver) = context(&dir, WorkerKind::Subtitle);
    let processor = RemoteProcessor::new(WorkerKind::Subtitle, config(&server)).unwrap();

    let payload = StagePayload::Subtitle(SubtitlePayload {
        media_url: Some("s3://out/jobs/job-1/transcode/720p.mp4".into()),
    });
    let output = processor.process(&input(Some(payload)), &ctx).await.unwrap();

    match output {
        TaskOutput::Subtitle(o) => {
            assert_eq!(o.tracks.len(), 1);
            assert_eq!(o.tracks[0].language, "en");
        }
        other => panic!("unexpected output {:?}", other),
    }
    assert_eq!(receiver.current(), 95);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/ai"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/ai"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "summary": "A short film",
            "tags": ["film"],
            "dubbedAudio": [{"language": "es", "url": "s3://out/es.aac"}]
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (ctx, _receiver) = context(&dir, WorkerKind::Ai);
    let processor = RemoteProcessor::new(WorkerKind::Ai, config(&server)).unwrap();

    let output = processor.process(&input(None), &ctx).await.unwrap();
    match output {
        TaskOutput::Ai(o) => {
            assert_eq!(o.summary.as_deref(), Some("A short film"));
            assert_eq!(o.dubbed_audio[0].language, "es");
        }
        other => panic!("unexpected output {:?}", other),
    }
}

#[tokio::test]
async fn test_client_errors_fail_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unsupported codec"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (ctx, _receiver) = context(&dir, WorkerKind::Subtitle);
    let processor = RemoteProcessor::new(WorkerKind::Subtitle, config(&server)).unwrap();

    let err = processor.process(&input(None), &ctx).await.unwrap_err();
    assert!(matches!(err, MediaError::RequestFailed(ref m) if m.contains("unsupported codec")));
}

#[tokio::test]
async fn test_mismatched_payload_is_rejected_before_calling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (ctx, _receiver) = context(&dir, WorkerKind::Subtitle);
    let processor = RemoteProcessor::new(WorkerKind::Subtitle, config(&server)).unwrap();

    let payload = StagePayload::Transcode(TranscodePayload::default());
    let err = processor.process(&input(Some(payload)), &ctx).await.unwrap_err();
    assert!(matches!(err, MediaError::PayloadMismatch { .. }));
}
