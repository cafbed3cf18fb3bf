//! Axum HTTP API for the MediaFlow orchestrator.
//!
//! This crate provides:
//! - Job creation, retry and inspection endpoints
//! - Liveness, readiness and Prometheus endpoints
//! - Per-IP rate limiting, request IDs and security headers

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
