//! Worker shell for one pipeline stage.
//!
//! This crate provides:
//! - Worker configuration from the environment
//! - The `WorkerShell` message handler: claim, fetch, process, report
//! - Structured per-task logging

pub mod config;
pub mod error;
pub mod logging;
pub mod shell;

pub use config::{StorageBackend, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use logging::TaskLogger;
pub use shell::{TaskRun, WorkerShell};
