//! Media processors.
//!
//! This crate provides:
//! - The `Processor` contract with an explicit progress reporter
//! - FFmpeg command building, running and progress parsing
//! - Thumbnail and transcode processors on ffmpeg
//! - A remote processor for the subtitle and AI services

pub mod command;
pub mod error;
pub mod probe;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod remote;
pub mod thumbnail;
pub mod transcode;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_media, MediaInfo};
pub use processor::{ArtifactPublisher, ProcessContext, ProcessInput, Processor, ProcessorOptions};
pub use progress::{FfmpegProgress, ProgressReceiver, ProgressReporter};
pub use registry::{MediaConfig, ProcessorRegistry};
pub use remote::{RemoteProcessor, RemoteProcessorConfig, RemoteRequest};
pub use thumbnail::ThumbnailProcessor;
pub use transcode::TranscodeProcessor;
