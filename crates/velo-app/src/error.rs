//! Application-level error type shared across binaries and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::server;
use crate::services::blob_store::BlobError;
use crate::services::detector::DetectError;
use crate::services::jobs::JobStoreError;
use crate::services::reaper::ReaperError;
use crate::services::results::ResultsLogError;
use crate::services::worker::PipelineError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("blob store error: {0}")]
    BlobStore(#[from] BlobError),
    #[error(transparent)]
    Server(#[from] server::ServerError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Detector(#[from] DetectError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Jobs(#[from] Box<JobStoreError>),
    #[error(transparent)]
    Reaper(#[from] ReaperError),
    #[error(transparent)]
    Results(#[from] ResultsLogError),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<JobStoreError> for AppError {
    fn from(e: JobStoreError) -> Self {
        AppError::Jobs(Box::new(e))
    }
}
