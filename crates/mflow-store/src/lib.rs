//! Persistence for the job aggregate.
//!
//! This crate provides:
//! - The `JobStore` trait with task-scoped mutations
//! - A Firestore REST backend with optimistic concurrency on whole-job saves
//! - An in-memory backend for tests and local runs

pub mod error;
pub mod firestore;
pub mod memory;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use firestore::{FirestoreClient, FirestoreConfig, FirestoreJobStore};
pub use memory::InMemoryJobStore;
pub use store::JobStore;
