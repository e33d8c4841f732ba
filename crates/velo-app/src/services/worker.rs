use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::watch;

use crate::services::blob_store::{BlobError, BlobStore, Bucket, bytes_stream, collect_bytes};
use crate::services::detector::FaceDetector;
use crate::services::jobs::{Job, JobOutcome, JobStore, JobStoreError};
use crate::services::reaper::{ReaperConfig, reap_expired_leases};
use crate::services::redact::{
    RedactionConfig, decode_image, encode_image, output_filename, redact_faces,
};
use crate::services::results::{DetectionRecord, ResultsLog};

// The polling orchestrator.
//
// One worker drives jobs from pending to terminal, strictly sequentially:
// claim, fetch input, detect, render, encode, upload, complete. Every error
// inside a job is caught at the job's scope and recorded on the job; one
// job's failure never aborts the batch, and the worker never exits on a
// processing error.

/// Errors that fail a single job. The Display text is what lands in the
/// job's `error` field; detection messages are preserved verbatim.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("blob `{blob_id}` not found in bucket `{bucket}`")]
    BlobNotFound { bucket: &'static str, blob_id: String },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("{0}")]
    Detection(String),
    #[error("failed to encode redacted image: {0}")]
    Encode(String),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("detection task aborted: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity stamped onto claimed jobs.
    pub worker_id: String,
    pub poll_interval: Duration,
    pub lease_ms: i64,
    /// Detections below this confidence are discarded before counting and
    /// rendering. `0.0` redacts every returned box.
    pub min_confidence: f64,
}

impl From<&crate::config::WorkerSettings> for WorkerConfig {
    fn from(settings: &crate::config::WorkerSettings) -> Self {
        Self {
            worker_id: settings.worker_id.clone(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            lease_ms: settings.lease_ms,
            min_confidence: settings.min_confidence,
        }
    }
}

/// Load the globally configured cover image, falling back to black
/// rectangles when the path is absent, unreadable, or not an image.
pub fn load_default_redaction(path: Option<&Path>) -> RedactionConfig {
    let Some(path) = path else {
        return RedactionConfig::black();
    };
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "could not read redaction image; using black rectangles");
            return RedactionConfig::black();
        }
    };
    match decode_image(&bytes) {
        Ok(cover) => {
            tracing::info!(path = %path.display(), "using custom redaction image");
            RedactionConfig::ImageOverlay(cover)
        }
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "could not decode redaction image; using black rectangles");
            RedactionConfig::black()
        }
    }
}

pub struct Worker {
    jobs: Arc<JobStore>,
    blobs: Arc<dyn BlobStore>,
    detector: Arc<dyn FaceDetector>,
    results: ResultsLog,
    default_redaction: RedactionConfig,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        jobs: Arc<JobStore>,
        blobs: Arc<dyn BlobStore>,
        detector: Arc<dyn FaceDetector>,
        results: ResultsLog,
        default_redaction: RedactionConfig,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            blobs,
            detector,
            results,
            default_redaction,
            config,
        }
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.config.worker_id, "redaction worker started");
        loop {
            match self.process_pending().await {
                Ok(0) => {}
                Ok(count) => tracing::debug!(jobs = count, "processed pending batch"),
                Err(err) => {
                    // The batch fetch itself failed; skip this tick and retry.
                    tracing::warn!(%err, "failed to poll pending jobs; retrying next tick");
                }
            }

            match reap_expired_leases(&self.jobs, &ReaperConfig::default()) {
                Ok(report) if !report.is_empty() => {
                    tracing::info!(
                        requeued = report.requeued.len(),
                        failed = report.failed.len(),
                        "reaped expired leases"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "lease reaper failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.config.worker_id, "redaction worker stopped");
    }

    /// One poll tick: snapshot pending jobs and drive each claimed one to a
    /// terminal state. Returns how many jobs this worker claimed.
    pub async fn process_pending(&self) -> Result<usize, JobStoreError> {
        let pending = self.jobs.find_pending()?;
        let mut processed = 0_usize;

        for job in pending {
            let claimed = match self.jobs.claim(&job.id, &self.config.worker_id, self.config.lease_ms) {
                Ok(Some(job)) => job,
                // Another worker won the race, or the job already finished.
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(%err, job_id = %job.id, "failed to claim job");
                    continue;
                }
            };
            self.handle_claimed(claimed).await;
            processed += 1;
        }

        Ok(processed)
    }

    async fn handle_claimed(&self, job: Job) {
        match self.process_job(&job).await {
            Ok((outcome, record)) => match self.jobs.complete(&job.id, outcome) {
                Ok(done) => {
                    tracing::info!(
                        job_id = %done.id,
                        filename = %done.filename,
                        num_faces = done.num_faces,
                        processing_time = done.processing_time,
                        "job completed"
                    );
                    // The job is already terminal; a feed hiccup must not fail it.
                    if let Err(err) = self.results.append(&record).await {
                        tracing::error!(%err, job_id = %job.id, "failed to append detection record");
                    }
                }
                Err(err) => {
                    tracing::error!(%err, job_id = %job.id, "failed to record completion");
                }
            },
            Err(err) => {
                tracing::warn!(%err, job_id = %job.id, "job failed");
                if let Err(store_err) = self.jobs.fail(&job.id, err.to_string()) {
                    tracing::error!(%store_err, job_id = %job.id, "failed to record job failure");
                }
            }
        }
    }

    async fn process_job(&self, job: &Job) -> Result<(JobOutcome, DetectionRecord), PipelineError> {
        let input = self.fetch_blob(Bucket::Input, "input", &job.input_blob_id).await?;
        let image = decode_image(&input)
            .map_err(|e| PipelineError::Decode(e.to_string()))?
            .to_rgb8();

        let redaction = self.resolve_redaction(job).await?;

        let started = Instant::now();

        let detector = Arc::clone(&self.detector);
        let (detected, image) = tokio::task::spawn_blocking(move || {
            let detected = detector.detect(&image);
            (detected, image)
        })
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))?;
        let faces = detected.map_err(|e| PipelineError::Detection(e.to_string()))?;

        let redacted = redact_faces(&image, &faces, &redaction, self.config.min_confidence);
        let num_faces = redacted.faces.len() as u32;
        let confidence_scores: Vec<f64> =
            redacted.faces.iter().map(|face| face.confidence).collect();

        let out_name = output_filename(&job.filename);
        let encoded = encode_image(&redacted.image, &job.filename)
            .map_err(|e| PipelineError::Encode(e.to_string()))?;

        let processing_time = started.elapsed().as_secs_f64();

        let mut metadata = JsonMap::new();
        metadata.insert("input_blob_id".into(), JsonValue::from(job.input_blob_id.clone()));
        metadata.insert("num_faces".into(), JsonValue::from(num_faces));
        metadata.insert("processing_time".into(), JsonValue::from(processing_time));

        let put = self
            .blobs
            .put(Bucket::Output, &out_name, bytes_stream(encoded), metadata)
            .await?;

        let outcome = JobOutcome {
            output_blob_id: put.blob_id,
            num_faces,
            confidence_scores: confidence_scores.clone(),
            processing_time,
        };
        let record = DetectionRecord {
            filename: job.filename.clone(),
            timestamp: Utc::now(),
            num_faces,
            confidence_scores,
            processing_time,
        };
        Ok((outcome, record))
    }

    /// Per-job redaction config. A custom cover that cannot be fetched fails
    /// the job; one that fetches but does not decode falls back to black
    /// rectangles.
    async fn resolve_redaction(&self, job: &Job) -> Result<RedactionConfig, PipelineError> {
        let Some(cover_blob_id) = &job.cover_blob_id else {
            return Ok(self.default_redaction.clone());
        };

        let bytes = self.fetch_blob(Bucket::Input, "cover", cover_blob_id).await?;
        match decode_image(&bytes) {
            Ok(cover) => Ok(RedactionConfig::ImageOverlay(cover)),
            Err(err) => {
                tracing::warn!(%err, job_id = %job.id, "cover image did not decode; using black rectangles");
                Ok(RedactionConfig::black())
            }
        }
    }

    async fn fetch_blob(
        &self,
        bucket: Bucket,
        label: &'static str,
        blob_id: &str,
    ) -> Result<Vec<u8>, PipelineError> {
        let stream = self.blobs.get(bucket, blob_id).await.map_err(|e| match e {
            BlobError::NotFound => PipelineError::BlobNotFound {
                bucket: label,
                blob_id: blob_id.to_string(),
            },
            other => PipelineError::Blob(other),
        })?;
        Ok(collect_bytes(stream).await?)
    }
}
