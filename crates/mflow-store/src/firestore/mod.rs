//! Firestore REST backend.
//!
//! Jobs live in one collection keyed by job ID. Tasks are stored as a map
//! keyed by task ID with a `position` field, so a task-scoped write is a
//! field-masked update of a single map entry.

mod client;
mod convert;
mod error;
mod job_store;
mod metrics;
mod retry;
mod token_cache;
mod types;

pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use job_store::FirestoreJobStore;
pub use retry::RetryConfig;
pub use types::{Document, Value};
