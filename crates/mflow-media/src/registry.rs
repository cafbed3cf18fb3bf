//! Processor selection per worker kind.

use std::sync::Arc;

use mflow_models::WorkerKind;

use crate::error::MediaResult;
use crate::processor::{Processor, ProcessorOptions};
use crate::remote::{RemoteProcessor, RemoteProcessorConfig};
use crate::thumbnail::ThumbnailProcessor;
use crate::transcode::TranscodeProcessor;

/// Settings needed to build any processor.
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub options: ProcessorOptions,
    /// Used by the `subtitle` and `ai` processors
    pub remote: RemoteProcessorConfig,
}

impl MediaConfig {
    pub fn from_env(kind: WorkerKind) -> Self {
        Self {
            options: ProcessorOptions::from_env(),
            remote: RemoteProcessorConfig::from_env(kind),
        }
    }
}

/// Builds the processor a worker of a given kind runs.
pub struct ProcessorRegistry;

impl ProcessorRegistry {
    pub fn for_kind(kind: WorkerKind, config: &MediaConfig) -> MediaResult<Arc<dyn Processor>> {
        let processor: Arc<dyn Processor> = match kind {
            WorkerKind::Thumbnail => Arc::new(ThumbnailProcessor::new()),
            WorkerKind::Transcode => Arc::new(TranscodeProcessor::new()),
            WorkerKind::Subtitle | WorkerKind::Ai => {
                Arc::new(RemoteProcessor::new(kind, config.remote.clone())?)
            }
        };
        Ok(processor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_processor() {
        let config = MediaConfig::default();
        for kind in WorkerKind::ALL {
            let processor = ProcessorRegistry::for_kind(kind, &config).unwrap();
            assert_eq!(processor.kind(), kind);
        }
    }
}
