//! The consume-process-report loop body for one worker kind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use mflow_media::{
    ArtifactPublisher, ProcessContext, ProcessInput, Processor, ProcessorOptions,
    ProgressReceiver, ProgressReporter,
};
use mflow_models::{JobId, TaskId, TaskOutput, TaskStatus, WorkerKind};
use mflow_queue::{
    Channel, Delivery, MessageChannel, MessageHandler, Outcome, QueueMessage, TaskCompletedEvent,
    TaskFailedEvent, TaskMessage,
};
use mflow_storage::Storage;
use mflow_store::JobStore;

use crate::error::{WorkerError, WorkerResult};
use crate::logging::TaskLogger;

const TASKS_TOTAL: &str = "mflow_worker_tasks_total";
const TASK_DURATION_SECONDS: &str = "mflow_worker_task_duration_seconds";

/// How a delivered task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRun {
    /// Processed, output persisted, `task_completed` published.
    Completed(TaskOutput),
    /// Failure persisted and `task_failed` published.
    Failed(String),
    /// Nothing to do for this delivery.
    Skipped(&'static str),
}

impl TaskRun {
    fn outcome(&self) -> Outcome {
        match self {
            TaskRun::Completed(_) | TaskRun::Skipped(_) => Outcome::Ack,
            TaskRun::Failed(_) => Outcome::Nack { requeue: false },
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TaskRun::Completed(_) => "completed",
            TaskRun::Failed(_) => "failed",
            TaskRun::Skipped(_) => "skipped",
        }
    }
}

/// Runs one stage's processor for each dispatch message.
///
/// The shell only writes its own task's progress, output and failure.
/// Job-level status belongs to the orchestrator.
pub struct WorkerShell {
    kind: WorkerKind,
    processor: Arc<dyn Processor>,
    store: Arc<dyn JobStore>,
    channel: Arc<dyn MessageChannel>,
    storage: Arc<dyn Storage>,
    options: Arc<ProcessorOptions>,
    work_dir: PathBuf,
}

impl WorkerShell {
    pub fn new(
        processor: Arc<dyn Processor>,
        store: Arc<dyn JobStore>,
        channel: Arc<dyn MessageChannel>,
        storage: Arc<dyn Storage>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: processor.kind(),
            processor,
            store,
            channel,
            storage,
            options: Arc::new(ProcessorOptions::default()),
            work_dir: work_dir.into(),
        }
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = Arc::new(options);
        self
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Run one validated dispatch message to completion or failure.
    pub async fn run_task(&self, message: TaskMessage) -> WorkerResult<TaskRun> {
        let Some(job) = self.store.get_job_by_id(&message.job_id).await? else {
            warn!(job_id = %message.job_id, "Dropping task for unknown job");
            return Ok(TaskRun::Skipped("unknown job"));
        };
        let Some(task) = job.task(&message.task_id) else {
            warn!(
                job_id = %message.job_id,
                task_id = %message.task_id,
                "Dropping unknown task"
            );
            return Ok(TaskRun::Skipped("unknown task"));
        };
        if task.worker_kind != self.kind {
            warn!(
                job_id = %message.job_id,
                task_id = %message.task_id,
                task_kind = %task.worker_kind,
                worker_kind = %self.kind,
                "Dropping task for another stage"
            );
            return Ok(TaskRun::Skipped("wrong stage"));
        }
        match task.status {
            TaskStatus::Completed => {
                debug!(task_id = %message.task_id, "Task already completed, skipping");
                return Ok(TaskRun::Skipped("already completed"));
            }
            TaskStatus::Failed => {
                debug!(task_id = %message.task_id, "Task already failed, skipping");
                return Ok(TaskRun::Skipped("already failed"));
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }

        let logger = TaskLogger::new(&message.job_id, &message.task_id, self.kind);
        let span = logger.create_span();
        let run: WorkerResult<TaskRun> = async {
            logger.log_start(&message.source_url);
            match self.execute(&message, &logger).await {
                Ok(output) => {
                    self.publish(TaskCompletedEvent {
                        job_id: message.job_id.clone(),
                        task_id: message.task_id.clone(),
                        task_type: self.kind,
                        output: output.clone(),
                    })
                    .await?;
                    logger.log_completion("output recorded");
                    Ok(TaskRun::Completed(output))
                }
                Err(e) => {
                    let reason = e.task_message();
                    logger.log_error(&reason);
                    self.report_failure(&message.job_id, &message.task_id, &reason, &logger)
                        .await?;
                    Ok(TaskRun::Failed(reason))
                }
            }
        }
        .instrument(span)
        .await;
        run
    }

    /// Mark running, fetch the input, process, persist the output.
    async fn execute(&self, message: &TaskMessage, logger: &TaskLogger) -> WorkerResult<TaskOutput> {
        self.store
            .update_task_status(&message.job_id, &message.task_id, TaskStatus::Running, Some(0))
            .await?;

        tokio::fs::create_dir_all(&self.work_dir).await?;
        // Removed on drop, whichever way the task ends
        let work = tempfile::Builder::new()
            .prefix(&format!("{}-", message.task_id))
            .tempdir_in(&self.work_dir)?;

        let input_url = message
            .payload
            .as_ref()
            .and_then(|p| p.media_url())
            .unwrap_or(message.source_url.as_str())
            .to_string();
        let input_dir = work.path().join("input");
        tokio::fs::create_dir_all(&input_dir).await?;
        let local_path = self.storage.download_file(&input_url, &input_dir).await?;
        logger.log_progress(&format!("input ready at {}", local_path.display()));

        let output_dir = work.path().join("output");
        tokio::fs::create_dir_all(&output_dir).await?;

        let input = ProcessInput {
            job_id: message.job_id.clone(),
            task_id: message.task_id.clone(),
            source_url: message.source_url.clone(),
            input_url,
            local_path,
            payload: message.payload.clone(),
        };

        let (reporter, receiver) = ProgressReporter::channel();
        let forwarder = self.forward_progress(message, receiver);
        let ctx = ProcessContext {
            output_dir,
            progress: reporter,
            artifacts: ArtifactPublisher::new(
                Arc::clone(&self.storage),
                &message.job_id,
                self.kind,
            ),
            options: Arc::clone(&self.options),
        };

        let result = self.processor.process(&input, &ctx).await;
        // Dropping the last reporter ends the forwarder once it has written
        // the final value, so no progress write lands after the output
        drop(ctx);
        if let Err(e) = forwarder.await {
            logger.log_warning(&format!("progress forwarder stopped: {}", e));
        }

        let output = result?;
        self.store
            .update_task_output(&message.job_id, &message.task_id, output.clone())
            .await?;
        Ok(output)
    }

    fn forward_progress(&self, message: &TaskMessage, mut receiver: ProgressReceiver) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let job_id = message.job_id.clone();
        let task_id = message.task_id.clone();

        tokio::spawn(async move {
            while let Some(progress) = receiver.changed().await {
                if let Err(e) = store
                    .update_task_status(&job_id, &task_id, TaskStatus::Running, Some(progress))
                    .await
                {
                    warn!(
                        job_id = %job_id,
                        task_id = %task_id,
                        progress,
                        "Failed to persist progress: {}",
                        e
                    );
                }
            }
        })
    }

    async fn report_failure(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        reason: &str,
        logger: &TaskLogger,
    ) -> WorkerResult<()> {
        // The event still goes out so the orchestrator can fail the job
        if let Err(e) = self.store.fail_task(job_id, task_id, reason).await {
            logger.log_warning(&format!("could not persist failure: {}", e));
        }
        self.publish(TaskFailedEvent {
            job_id: job_id.clone(),
            task_id: task_id.clone(),
            error: Some(reason.to_string()),
        })
        .await
    }

    async fn publish(&self, event: impl Into<QueueMessage>) -> WorkerResult<()> {
        let message = event.into();
        let channel = match &message {
            QueueMessage::TaskCompleted(_) => Channel::TaskCompleted,
            QueueMessage::TaskFailed(_) => Channel::TaskFailed,
            QueueMessage::Task(_) => Channel::Tasks(self.kind),
        };
        self.channel.publish(channel, &message).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for WorkerShell {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Outcome> {
        let message = match delivery.task_message() {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    channel = %delivery.channel,
                    message_id = %delivery.id,
                    "Dropping malformed task message: {}",
                    e
                );
                counter!(TASKS_TOTAL, "worker_kind" => self.kind.as_str(), "outcome" => "malformed")
                    .increment(1);
                return Ok(Outcome::Ack);
            }
        };

        let started = Instant::now();
        let run = self.run_task(message).await.map_err(|e: WorkerError| {
            counter!(TASKS_TOTAL, "worker_kind" => self.kind.as_str(), "outcome" => "error")
                .increment(1);
            e
        })?;

        counter!(TASKS_TOTAL, "worker_kind" => self.kind.as_str(), "outcome" => run.label())
            .increment(1);
        if !matches!(run, TaskRun::Skipped(_)) {
            histogram!(TASK_DURATION_SECONDS, "worker_kind" => self.kind.as_str())
                .record(started.elapsed().as_secs_f64());
        }
        Ok(run.outcome())
    }
}
