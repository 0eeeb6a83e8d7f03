//! HTTP service for Parcel chunked uploads.
//!
//! This crate provides:
//! - The upload session coordinator and reassembler
//! - The background expiry sweeper
//! - Upload, status, cancel and artifact endpoints
//! - Health and Prometheus metrics endpoints

pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod reassembly;
pub mod routes;
pub mod state;
pub mod sweeper;

pub use coordinator::{SweepStats, UploadCoordinator};
pub use error::{ApiError, UploadError};
pub use reassembly::Reassembler;
pub use routes::create_router;
pub use state::AppState;
