use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::paths::{AppPaths, PathError};

// Denormalized detection-results feed.
//
// One JSON object per line, append-only, independent of the job store.
// Downstream reporting reads this file (or the HTTP feed) without touching
// job records.

/// One processed image, as reported to analytics consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub num_faces: u32,
    pub confidence_scores: Vec<f64>,
    /// Seconds spent in detect + render + encode.
    pub processing_time: f64,
}

#[derive(Debug, Error)]
pub enum ResultsLogError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to append detection record: {0}")]
    Append(#[source] std::io::Error),
    #[error("failed to read results log: {0}")]
    Read(#[source] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Append-only JSONL log of [`DetectionRecord`]s.
#[derive(Debug, Clone)]
pub struct ResultsLog {
    path: PathBuf,
}

impl ResultsLog {
    pub fn open(paths: &AppPaths) -> Result<Self, ResultsLogError> {
        Ok(Self {
            path: paths.results_log_path()?,
        })
    }

    pub async fn append(&self, record: &DetectionRecord) -> Result<(), ResultsLogError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(ResultsLogError::Append)?;
        file.write_all(&line).await.map_err(ResultsLogError::Append)?;
        Ok(())
    }

    /// All records in append order. Unparsable lines are skipped with a
    /// warning so one torn write cannot poison the whole feed.
    pub async fn read_all(&self) -> Result<Vec<DetectionRecord>, ResultsLogError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ResultsLogError::Read(e)),
        };

        let mut out = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DetectionRecord>(line) {
                Ok(record) => out.push(record),
                Err(err) => {
                    tracing::warn!(%err, "skipping unparsable results-log line");
                }
            }
        }
        Ok(out)
    }
}
