//! End-to-end orchestration over the in-memory channel and store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mflow_models::{
    CreateJobRequest, Job, JobStatus, Pipeline, StagePayload, SubtitleOutput, SubtitleTrack,
    TaskId, TaskOutput, TaskStatus, ThumbnailOutput, TranscodeOutput, WorkerKind,
};
use mflow_orchestrator::{Advance, Orchestrator, OrchestratorConfig, OrchestratorError};
use mflow_queue::{
    Channel, Delivery, InMemoryChannel, MessageChannel, QueueError, QueueMessage, QueueResult,
    TaskCompletedEvent, TaskFailedEvent, TaskMessage,
};
use mflow_store::{InMemoryJobStore, JobStore};

struct Harness {
    store: Arc<InMemoryJobStore>,
    channel: Arc<InMemoryChannel>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(stages: &[WorkerKind]) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let pipeline = Arc::new(Pipeline::from_kinds(stages.iter().copied()).unwrap());
        let orchestrator = Orchestrator::new(
            store.clone(),
            channel.clone(),
            pipeline,
            &OrchestratorConfig::default(),
        );
        Self {
            store,
            channel,
            orchestrator,
        }
    }

    async fn create(&self, media_id: &str, source_url: &str) -> Job {
        self.orchestrator
            .create_job(CreateJobRequest {
                media_id: Some(media_id.into()),
                source_url: Some(source_url.into()),
            })
            .await
            .unwrap()
    }

    async fn job(&self, job: &Job) -> Job {
        self.store.get_job_by_id(&job.id).await.unwrap().unwrap()
    }

    fn dispatched(&self, kind: WorkerKind) -> Vec<TaskMessage> {
        self.channel
            .published_on(Channel::Tasks(kind))
            .into_iter()
            .map(|m| match m {
                QueueMessage::Task(t) => t,
                other => panic!("unexpected message {:?}", other),
            })
            .collect()
    }

    /// What a worker does before publishing its completion.
    async fn run_task(&self, job: &Job, task_id: &TaskId) {
        self.store
            .update_task_status(&job.id, task_id, TaskStatus::Running, Some(0))
            .await
            .unwrap();
    }

    async fn complete(&self, job: &Job, task_id: &TaskId, output: TaskOutput) -> Advance {
        self.run_task(job, task_id).await;
        self.orchestrator
            .handle_task_completed(TaskCompletedEvent {
                job_id: job.id.clone(),
                task_id: task_id.clone(),
                task_type: output.worker_kind(),
                output,
            })
            .await
            .unwrap()
    }

    /// The same completion event again, as an at-least-once broker may send it.
    async fn redeliver_completion(
        &self,
        job: &Job,
        task_id: &TaskId,
        output: TaskOutput,
    ) -> Advance {
        self.orchestrator
            .handle_task_completed(TaskCompletedEvent {
                job_id: job.id.clone(),
                task_id: task_id.clone(),
                task_type: output.worker_kind(),
                output,
            })
            .await
            .unwrap()
    }

    async fn fail(&self, job: &Job, task_id: &TaskId, error: &str) -> Job {
        self.run_task(job, task_id).await;
        self.store.fail_task(&job.id, task_id, error).await.unwrap();
        self.orchestrator
            .handle_task_failed(TaskFailedEvent {
                job_id: job.id.clone(),
                task_id: task_id.clone(),
                error: Some(error.into()),
            })
            .await
            .unwrap()
    }
}

/// In-memory channel whose publishes can be switched to fail.
struct FlakyChannel {
    inner: InMemoryChannel,
    failing: AtomicBool,
}

impl FlakyChannel {
    fn new() -> Self {
        Self {
            inner: InMemoryChannel::new(),
            failing: AtomicBool::new(false),
        }
    }

    fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageChannel for FlakyChannel {
    async fn init(&self, channel: Channel) -> QueueResult<()> {
        self.inner.init(channel).await
    }

    async fn publish(&self, channel: Channel, message: &QueueMessage) -> QueueResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::publish_failed("broker unavailable"));
        }
        self.inner.publish(channel, message).await
    }

    async fn receive(
        &self,
        channel: Channel,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        self.inner.receive(channel, consumer, max, block).await
    }

    async fn claim_pending(
        &self,
        channel: Channel,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>> {
        self.inner.claim_pending(channel, consumer, min_idle, max).await
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.inner.ack(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> QueueResult<()> {
        self.inner.nack(delivery, requeue).await
    }

    async fn ping(&self) -> QueueResult<()> {
        self.inner.ping().await
    }
}

fn thumbnail_output() -> TaskOutput {
    TaskOutput::Thumbnail(ThumbnailOutput {
        thumbnail_url: "s3://out/m1/thumbnail.jpg".into(),
        width: Some(480),
        height: Some(270),
    })
}

fn transcode_output() -> TaskOutput {
    TaskOutput::Transcode(TranscodeOutput {
        output_url: "s3://out/m1/1080p.mp4".into(),
        renditions: vec![],
    })
}

const TWO_STAGES: [WorkerKind; 2] = [WorkerKind::Thumbnail, WorkerKind::Transcode];

#[tokio::test]
async fn scenario_a_create_dispatches_first_stage() {
    let h = Harness::new(&TWO_STAGES);

    let job = h.create("m1", "s3://m1.mp4").await;

    let sent = h.dispatched(WorkerKind::Thumbnail);
    assert_eq!(sent.len(), 1);
    assert_eq!(h.channel.published_count(), 1);
    assert_eq!(sent[0].job_id, job.id);
    assert_eq!(sent[0].source_url, "s3://m1.mp4");

    let stored = h.job(&job).await;
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.tasks.len(), 1);
    assert_eq!(stored.tasks[0].worker_kind, WorkerKind::Thumbnail);
    assert_eq!(stored.tasks[0].status, TaskStatus::Pending);
    assert_eq!(sent[0].task_id, stored.tasks[0].id);
}

#[tokio::test]
async fn scenario_b_completion_dispatches_next_stage() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;
    let thumbnail = job.tasks[0].id.clone();

    let advance = h.complete(&job, &thumbnail, thumbnail_output()).await;

    let stored = h.job(&job).await;
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.tasks[0].status, TaskStatus::Completed);
    assert_eq!(stored.tasks[0].progress, 100);
    assert_eq!(stored.tasks[0].output, Some(thumbnail_output()));
    assert_eq!(stored.tasks[1].worker_kind, WorkerKind::Transcode);
    assert_eq!(stored.tasks[1].status, TaskStatus::Pending);
    assert_eq!(
        advance,
        Advance::Dispatched {
            task_id: stored.tasks[1].id.clone(),
            worker_kind: WorkerKind::Transcode,
        }
    );

    let sent = h.dispatched(WorkerKind::Transcode);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].task_id, stored.tasks[1].id);
    assert_eq!(sent[0].source_url, "s3://m1.mp4");
    match &sent[0].payload {
        Some(StagePayload::Transcode(p)) => {
            assert_eq!(p.poster_url.as_deref(), Some("s3://out/m1/thumbnail.jpg"));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn scenario_c_failure_fails_job_without_dispatch() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;
    h.complete(&job, &job.tasks[0].id.clone(), thumbnail_output())
        .await;
    let transcode = h.job(&job).await.tasks[1].id.clone();
    let published = h.channel.published_count();

    let failed = h.fail(&job, &transcode, "ffmpeg exited with 1").await;

    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("ffmpeg exited with 1"));
    assert_eq!(failed.tasks[1].status, TaskStatus::Failed);
    assert_eq!(
        failed.tasks[1].error_message.as_deref(),
        Some("ffmpeg exited with 1")
    );
    // Upstream work is not rolled back
    assert_eq!(failed.tasks[0].status, TaskStatus::Completed);
    assert_eq!(failed.tasks[0].output, Some(thumbnail_output()));
    assert_eq!(h.channel.published_count(), published);
}

#[tokio::test]
async fn scenario_d_retry_redispatches_failed_stage() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;
    h.complete(&job, &job.tasks[0].id.clone(), thumbnail_output())
        .await;
    let transcode = h.job(&job).await.tasks[1].id.clone();
    h.fail(&job, &transcode, "ffmpeg exited with 1").await;
    h.channel.clear_published();

    let retried = h.orchestrator.retry_job("m1").await.unwrap();

    assert_eq!(retried.status, JobStatus::Pending);
    assert!(retried.error.is_none());
    assert_eq!(retried.tasks[1].status, TaskStatus::Pending);
    assert!(retried.tasks[1].error_message.is_none());
    assert_eq!(retried.tasks[1].progress, 0);
    assert_eq!(retried.tasks[0].status, TaskStatus::Completed);
    assert_eq!(retried.tasks[0].output, Some(thumbnail_output()));

    let sent = h.dispatched(WorkerKind::Transcode);
    assert_eq!(sent.len(), 1);
    assert_eq!(h.channel.published_count(), 1);
    assert_eq!(sent[0].task_id, transcode);
    assert_eq!(sent[0].source_url, "s3://m1.mp4");
}

#[tokio::test]
async fn scenario_e_retry_of_completed_job_is_noop() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;
    h.complete(&job, &job.tasks[0].id.clone(), thumbnail_output())
        .await;
    let transcode = h.job(&job).await.tasks[1].id.clone();
    let advance = h.complete(&job, &transcode, transcode_output()).await;
    assert_eq!(advance, Advance::JobCompleted);

    let before = h.job(&job).await;
    assert_eq!(before.status, JobStatus::Completed);
    assert_eq!(before.output_url.as_deref(), Some("s3://out/m1/1080p.mp4"));
    h.channel.clear_published();

    let after = h.orchestrator.retry_job("m1").await.unwrap();

    assert_eq!(h.channel.published_count(), 0);
    assert_eq!(after, before);
    assert_eq!(h.job(&job).await, before);
}

#[tokio::test]
async fn test_retry_of_pending_job_changes_nothing() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;
    let before = h.job(&job).await;
    h.channel.clear_published();

    h.orchestrator.retry_job("m1").await.unwrap();

    assert_eq!(h.channel.published_count(), 0);
    assert_eq!(h.job(&job).await, before);
}

#[tokio::test]
async fn test_redelivered_completion_after_next_stage_started_dispatches_nothing() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;
    let thumbnail = job.tasks[0].id.clone();
    h.complete(&job, &thumbnail, thumbnail_output()).await;
    let transcode = h.job(&job).await.tasks[1].id.clone();
    h.run_task(&job, &transcode).await;
    let published = h.channel.published_count();

    let again = h.redeliver_completion(&job, &thumbnail, thumbnail_output()).await;

    assert_eq!(again, Advance::Unchanged);
    assert_eq!(h.channel.published_count(), published);
    assert_eq!(h.job(&job).await.tasks.len(), 2);
}

#[tokio::test]
async fn test_redelivered_completion_republishes_next_task_never_sent() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;
    let thumbnail = job.tasks[0].id.clone();

    // Completion recorded and transcode appended, then the process died
    // before publishing the transcode message
    h.run_task(&job, &thumbnail).await;
    h.store
        .update_task_output(&job.id, &thumbnail, thumbnail_output())
        .await
        .unwrap();
    h.store
        .update_task_status(&job.id, &thumbnail, TaskStatus::Completed, Some(100))
        .await
        .unwrap();
    let mut stranded = h.job(&job).await;
    stranded.append_task(WorkerKind::Transcode);
    let stranded = h.store.save(stranded).await.unwrap();
    let transcode = stranded.tasks[1].id.clone();
    h.channel.clear_published();

    let advance = h.redeliver_completion(&job, &thumbnail, thumbnail_output()).await;

    assert_eq!(
        advance,
        Advance::Redispatched {
            task_id: transcode.clone(),
            worker_kind: WorkerKind::Transcode,
        }
    );
    let sent = h.dispatched(WorkerKind::Transcode);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].task_id, transcode);
    assert!(matches!(sent[0].payload, Some(StagePayload::Transcode(_))));
    let stored = h.job(&job).await;
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.tasks.len(), 2);
}

#[tokio::test]
async fn test_failed_publish_fails_job_and_retry_recovers() {
    let store = Arc::new(InMemoryJobStore::new());
    let channel = Arc::new(FlakyChannel::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        channel.clone(),
        Arc::new(Pipeline::from_kinds(TWO_STAGES).unwrap()),
        &OrchestratorConfig::default(),
    );

    channel.fail_publishes(true);
    let err = orchestrator
        .create_job(CreateJobRequest {
            media_id: Some("m1".into()),
            source_url: Some("s3://m1.mp4".into()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Queue(_)));

    let stored = store.get_job_by_media_id("m1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let reason = stored.error.clone().unwrap();
    assert!(reason.contains("Failed to dispatch thumbnail task"), "{}", reason);
    assert_eq!(stored.tasks[0].status, TaskStatus::Pending);
    assert_eq!(channel.inner.published_count(), 0);

    channel.fail_publishes(false);
    let retried = orchestrator.retry_job("m1").await.unwrap();

    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.error, None);
    let sent = channel.inner.published_on(Channel::Tasks(WorkerKind::Thumbnail));
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        QueueMessage::Task(t) => assert_eq!(t.task_id, stored.tasks[0].id),
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_every_stage_of_default_pipeline_advances_once() {
    let stages = [
        WorkerKind::Thumbnail,
        WorkerKind::Subtitle,
        WorkerKind::Ai,
        WorkerKind::Transcode,
    ];
    let h = Harness::new(&stages);
    let job = h.create("m1", "s3://m1.mp4").await;

    let outputs = [
        thumbnail_output(),
        TaskOutput::Subtitle(SubtitleOutput {
            tracks: vec![SubtitleTrack {
                language: "en".into(),
                url: "s3://out/m1/en.vtt".into(),
            }],
        }),
        TaskOutput::Ai(mflow_models::AiOutput {
            summary: Some("a talk".into()),
            tags: vec!["talk".into()],
            dubbed_audio: vec![],
        }),
        transcode_output(),
    ];

    for (i, output) in outputs.into_iter().enumerate() {
        let task_id = h.job(&job).await.tasks[i].id.clone();
        let advance = h.complete(&job, &task_id, output).await;

        let stored = h.job(&job).await;
        if i + 1 < stages.len() {
            assert_eq!(stored.status, JobStatus::Pending);
            assert_eq!(h.dispatched(stages[i + 1]).len(), 1);
            assert!(matches!(advance, Advance::Dispatched { worker_kind, .. } if worker_kind == stages[i + 1]));
        } else {
            assert_eq!(stored.status, JobStatus::Completed);
            assert_eq!(advance, Advance::JobCompleted);
        }
    }

    assert_eq!(h.channel.published_count(), stages.len());
    let transcode = h.dispatched(WorkerKind::Transcode);
    match &transcode[0].payload {
        Some(StagePayload::Transcode(p)) => {
            assert_eq!(p.subtitle_tracks.len(), 1);
            assert_eq!(p.poster_url.as_deref(), Some("s3://out/m1/thumbnail.jpg"));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_failure_of_first_stage_fails_job() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;

    // The orchestrator fills in the task failure when the worker could not
    let failed = h
        .orchestrator
        .handle_task_failed(TaskFailedEvent {
            job_id: job.id.clone(),
            task_id: job.tasks[0].id.clone(),
            error: None,
        })
        .await
        .unwrap();

    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Task failed"));
    assert_eq!(failed.tasks[0].status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_completion_after_failure_never_dispatches() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;
    let thumbnail = job.tasks[0].id.clone();
    h.run_task(&job, &thumbnail).await;

    // Job failed by an operator-visible path while the task still ran
    let mut stored = h.job(&job).await;
    stored.mark_failed("dispatch failed");
    h.store.save(stored).await.unwrap();
    h.channel.clear_published();

    let advance = h.complete(&job, &thumbnail, thumbnail_output()).await;

    assert_eq!(advance, Advance::Unchanged);
    assert_eq!(h.channel.published_count(), 0);
    let stored = h.job(&job).await;
    assert_eq!(stored.tasks[0].status, TaskStatus::Completed);
    assert_eq!(stored.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_mismatched_output_is_rejected() {
    let h = Harness::new(&TWO_STAGES);
    let job = h.create("m1", "s3://m1.mp4").await;

    let err = h
        .orchestrator
        .handle_task_completed(TaskCompletedEvent {
            job_id: job.id.clone(),
            task_id: job.tasks[0].id.clone(),
            task_type: WorkerKind::Thumbnail,
            output: transcode_output(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::RejectedEvent(_)));
    assert_eq!(h.job(&job).await.tasks[0].status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_create_rejects_missing_fields() {
    let h = Harness::new(&TWO_STAGES);

    let err = h
        .orchestrator
        .create_job(CreateJobRequest {
            media_id: Some("m1".into()),
            source_url: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    assert!(h.store.is_empty().await);
    assert_eq!(h.channel.published_count(), 0);
}

#[tokio::test]
async fn test_retry_unknown_media_is_not_found() {
    let h = Harness::new(&TWO_STAGES);
    let err = h.orchestrator.retry_job("missing").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}
