//! Ordered pipeline definition.
//!
//! The stage list is loaded once per process and must be identical in the
//! orchestrator and every worker, since stage order determines routing.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::{UnknownWorkerKind, WorkerKind};

/// Stage order used when `PIPELINE_STAGES` is not set.
pub const DEFAULT_STAGES: [WorkerKind; 4] = [
    WorkerKind::Thumbnail,
    WorkerKind::Subtitle,
    WorkerKind::Ai,
    WorkerKind::Transcode,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline must contain at least one stage")]
    Empty,

    #[error("stage {0} appears more than once")]
    DuplicateStage(WorkerKind),

    #[error(transparent)]
    UnknownKind(#[from] UnknownWorkerKind),
}

/// A named step in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StageDescriptor {
    pub name: String,
    pub worker_kind: WorkerKind,
}

impl StageDescriptor {
    pub fn for_kind(worker_kind: WorkerKind) -> Self {
        Self {
            name: worker_kind.as_str().to_string(),
            worker_kind,
        }
    }
}

/// Fixed, ordered list of stages. Never empty, no kind repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
}

impl Pipeline {
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        for (i, stage) in stages.iter().enumerate() {
            if stages[..i].iter().any(|s| s.worker_kind == stage.worker_kind) {
                return Err(PipelineError::DuplicateStage(stage.worker_kind));
            }
        }
        Ok(Self { stages })
    }

    pub fn from_kinds(kinds: impl IntoIterator<Item = WorkerKind>) -> Result<Self, PipelineError> {
        Self::new(kinds.into_iter().map(StageDescriptor::for_kind).collect())
    }

    /// Load from `PIPELINE_STAGES` (comma separated kinds), falling back to
    /// [`DEFAULT_STAGES`].
    pub fn from_env() -> Result<Self, PipelineError> {
        match std::env::var("PIPELINE_STAGES") {
            Ok(raw) if !raw.trim().is_empty() => raw.parse(),
            _ => Ok(Self::default()),
        }
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn first(&self) -> &StageDescriptor {
        &self.stages[0]
    }

    pub fn is_last(&self, kind: WorkerKind) -> bool {
        self.stages.last().map(|s| s.worker_kind) == Some(kind)
    }

    pub fn position(&self, kind: WorkerKind) -> Option<usize> {
        self.stages.iter().position(|s| s.worker_kind == kind)
    }

    pub fn contains(&self, kind: WorkerKind) -> bool {
        self.position(kind).is_some()
    }

    /// The stage following `current`, or `None` if `current` is last or
    /// not part of this pipeline.
    pub fn next_stage(&self, current: WorkerKind) -> Option<&StageDescriptor> {
        self.position(current).and_then(|i| self.stages.get(i + 1))
    }

    pub fn kinds(&self) -> impl Iterator<Item = WorkerKind> + '_ {
        self.stages.iter().map(|s| s.worker_kind)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            stages: DEFAULT_STAGES.into_iter().map(StageDescriptor::for_kind).collect(),
        }
    }
}

impl FromStr for Pipeline {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kinds = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(WorkerKind::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_kinds(kinds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_stage() {
        let pipeline = Pipeline::from_kinds([WorkerKind::Thumbnail, WorkerKind::Transcode]).unwrap();

        assert_eq!(pipeline.first().worker_kind, WorkerKind::Thumbnail);
        assert_eq!(
            pipeline.next_stage(WorkerKind::Thumbnail).map(|s| s.worker_kind),
            Some(WorkerKind::Transcode)
        );
        assert!(pipeline.next_stage(WorkerKind::Transcode).is_none());
        assert!(pipeline.next_stage(WorkerKind::Ai).is_none());
        assert!(pipeline.is_last(WorkerKind::Transcode));
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert_eq!(Pipeline::from_kinds([]), Err(PipelineError::Empty));
        assert_eq!(
            Pipeline::from_kinds([WorkerKind::Ai, WorkerKind::Thumbnail, WorkerKind::Ai]),
            Err(PipelineError::DuplicateStage(WorkerKind::Ai))
        );
    }

    #[test]
    fn test_parse() {
        let pipeline: Pipeline = "thumbnail, transcode".parse().unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.position(WorkerKind::Transcode), Some(1));

        assert!(matches!(
            "thumbnail,upscale".parse::<Pipeline>(),
            Err(PipelineError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_default_order() {
        let kinds: Vec<_> = Pipeline::default().kinds().collect();
        assert_eq!(kinds, DEFAULT_STAGES.to_vec());
    }
}
