//! Velo: an asynchronous face-redaction pipeline.
//!
//! A caller uploads an image and submits a job; a polling worker detects
//! faces, paints over each detected region, stores the redacted image, and
//! records per-job metadata. The crate is split into the blob store, the
//! LMDB-backed job store, the pure redaction renderer, the detector adapter,
//! and the worker loop that ties them together, with a thin axum surface on
//! top.

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod paths;
pub mod server;
pub mod services;

pub use error::AppError;
