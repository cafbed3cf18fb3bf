//! Job orchestration for the MediaFlow pipeline.
//!
//! This crate provides:
//! - The payload factory and task dispatcher
//! - The create, advance and retry use cases
//! - The event consumer for task completions and failures
//! - A report-only stale task detector

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod payload;
pub mod stale;

pub use config::OrchestratorConfig;
pub use dispatcher::TaskDispatcher;
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{EventConsumers, EventHandler};
pub use orchestrator::{Advance, Orchestrator};
pub use payload::{build_payload, build_task_message};
pub use stale::{find_stale_tasks, StaleTask, StaleTaskDetector};
