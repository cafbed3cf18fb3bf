//! Storage collaborator for media workers.
//!
//! This crate provides:
//! - The `Storage` trait (`download_file`, `save_file`)
//! - An R2/S3 backend with HTTP(S) source downloads
//! - A local filesystem backend for development and tests

pub mod client;
pub mod error;
pub mod http;
pub mod local;
pub mod location;
pub mod storage;

pub use client::{R2Client, R2Config};
pub use error::{StorageError, StorageResult};
pub use local::LocalStorage;
pub use location::Location;
pub use storage::{content_type_for, Storage};
