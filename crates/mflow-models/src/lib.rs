//! Shared domain models for the MediaFlow pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs and their embedded per-stage tasks
//! - The closed set of worker kinds and their outputs
//! - Stage payloads threaded from upstream outputs
//! - The ordered pipeline definition

pub mod job;
pub mod output;
pub mod payload;
pub mod pipeline;
pub mod request;
pub mod task;
pub mod worker_kind;

// Re-export common types
pub use job::{Job, JobId, JobStatus};
pub use output::{
    AiOutput, AudioTrack, Rendition, SubtitleOutput, SubtitleTrack, TaskOutput, ThumbnailOutput,
    TranscodeOutput,
};
pub use payload::{AiPayload, StagePayload, SubtitlePayload, ThumbnailPayload, TranscodePayload};
pub use pipeline::{Pipeline, PipelineError, StageDescriptor, DEFAULT_STAGES};
pub use request::{CreateJobRequest, CreateJobResponse};
pub use task::{InvalidTransition, Task, TaskId, TaskStatus};
pub use worker_kind::{UnknownWorkerKind, WorkerKind};
