use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};

const JOB_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB

/// Lifecycle state of a redaction job.
///
/// `Pending → Processing → {Completed, Failed}`. `Processing` is the claim
/// state: it carries a worker id and a lease so a crashed worker's job can be
/// returned to `Pending` by the reaper. `Completed` and `Failed` are terminal
/// and write-protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One redaction request and its lifecycle record.
///
/// References blobs by id only; image bytes never live on the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub input_blob_id: String,
    #[serde(default)]
    pub cover_blob_id: Option<String>,
    pub filename: String,
    pub status: JobStatus,
    #[serde(default)]
    pub output_blob_id: Option<String>,
    #[serde(default)]
    pub num_faces: u32,
    #[serde(default)]
    pub confidence_scores: Vec<f64>,
    /// Wall-clock seconds spent in detect + render + encode.
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default)]
    pub error: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<i64>,
    #[serde(default)]
    pub claim_count: u32,
}

impl Job {
    pub fn has_custom_cover(&self) -> bool {
        self.cover_blob_id.is_some()
    }
}

/// Fields supplied at submission time. Drafts always enter as `Pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDraft {
    pub input_blob_id: String,
    pub filename: String,
    #[serde(default)]
    pub cover_blob_id: Option<String>,
}

/// Fields recorded when a job finishes successfully.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub output_blob_id: String,
    pub num_faces: u32,
    pub confidence_scores: Vec<f64>,
    pub processing_time: f64,
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

/// Errors emitted by the job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("job `{job_id}` is terminal ({status:?}) and cannot be modified")]
    TerminalState { job_id: String, status: JobStatus },
}

/// LMDB-backed persistence for redaction jobs.
#[derive(Debug)]
pub struct JobStore {
    env: Env,
    jobs: Database<Str, Bytes>,
}

impl JobStore {
    pub fn open(paths: &AppPaths) -> Result<Self, JobStoreError> {
        let path = paths.jobs_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(JOB_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let jobs = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("jobs"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("jobs"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, jobs })
    }

    /// Persist a new job from a draft and return it. The store assigns the id.
    pub fn create(&self, draft: JobDraft) -> Result<Job, JobStoreError> {
        debug_assert!(!draft.input_blob_id.is_empty());
        let now_ms = current_timestamp_ms();
        let job = Job {
            id: uuid::Uuid::new_v4().simple().to_string(),
            input_blob_id: draft.input_blob_id,
            cover_blob_id: draft.cover_blob_id,
            filename: draft.filename,
            status: JobStatus::Pending,
            output_blob_id: None,
            num_faces: 0,
            confidence_scores: Vec::new(),
            processing_time: 0.0,
            error: None,
            created_at: now_ms,
            completed_at: None,
            worker_id: None,
            lease_expires_at: None,
            claim_count: 0,
        };

        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(&job, config::standard())?;
        self.jobs.put(&mut wtxn, job.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        debug_assert!(!job_id.is_empty());
        let rtxn = self.env.read_txn()?;
        let value = self.jobs.get(&rtxn, job_id)?;
        if let Some(raw) = value {
            let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
            Ok(Some(job))
        } else {
            Ok(None)
        }
    }

    /// Current snapshot of pending jobs, oldest first. Does not lock them.
    pub fn find_pending(&self) -> Result<Vec<Job>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.jobs.iter(&rtxn)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
            if job.status == JobStatus::Pending {
                out.push(job);
            }
        }
        out.sort_by_key(|job| job.created_at);
        Ok(out)
    }

    /// Look a job up by the input blob id its submitter holds.
    pub fn find_by_input_blob(&self, blob_id: &str) -> Result<Option<Job>, JobStoreError> {
        debug_assert!(!blob_id.is_empty());
        let rtxn = self.env.read_txn()?;
        let iter = self.jobs.iter(&rtxn)?;
        for entry in iter {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
            if job.input_blob_id == blob_id {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Atomically claim a pending job for a worker.
    ///
    /// The read-modify-write happens inside a single LMDB write transaction,
    /// so of any number of workers racing on the same snapshot exactly one
    /// observes `Pending` and wins. Returns `None` when the job is no longer
    /// pending (someone else claimed or finished it).
    pub fn claim(
        &self,
        job_id: &str,
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<Option<Job>, JobStoreError> {
        debug_assert!(!worker_id.is_empty());
        debug_assert!(lease_ms > 0);

        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;

        if job.status != JobStatus::Pending {
            return Ok(None);
        }

        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.lease_expires_at = Some(current_timestamp_ms() + lease_ms);
        job.claim_count = job.claim_count.saturating_add(1);

        let encoded = encode_to_vec(&job, config::standard())?;
        self.jobs.put(&mut wtxn, job_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(Some(job))
    }

    /// Transition a job to `Completed`. Refuses terminal records.
    pub fn complete(&self, job_id: &str, outcome: JobOutcome) -> Result<Job, JobStoreError> {
        debug_assert_eq!(
            outcome.confidence_scores.len(),
            outcome.num_faces as usize,
            "one confidence score per counted face"
        );
        self.finish(job_id, |job| {
            job.status = JobStatus::Completed;
            job.output_blob_id = Some(outcome.output_blob_id.clone());
            job.num_faces = outcome.num_faces;
            job.confidence_scores = outcome.confidence_scores.clone();
            job.processing_time = outcome.processing_time;
            job.error = None;
        })
    }

    /// Transition a job to `Failed` with the error message. Refuses terminal records.
    pub fn fail(&self, job_id: &str, error: impl Into<String>) -> Result<Job, JobStoreError> {
        let error = error.into();
        self.finish(job_id, |job| {
            job.status = JobStatus::Failed;
            job.output_blob_id = None;
            job.error = Some(error.clone());
        })
    }

    fn finish(
        &self,
        job_id: &str,
        apply: impl Fn(&mut Job),
    ) -> Result<Job, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;

        if job.status.is_terminal() {
            return Err(JobStoreError::TerminalState {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        apply(&mut job);
        job.completed_at = Some(current_timestamp_ms());
        job.lease_expires_at = None;

        let encoded = encode_to_vec(&job, config::standard())?;
        self.jobs.put(&mut wtxn, job_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(job)
    }

    /// Return an expired-lease `Processing` job to `Pending` (reaper path).
    /// No-op returning `None` when the job is not in `Processing` anymore.
    pub fn requeue(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;

        if job.status != JobStatus::Processing {
            return Ok(None);
        }

        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.lease_expires_at = None;

        let encoded = encode_to_vec(&job, config::standard())?;
        self.jobs.put(&mut wtxn, job_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(Some(job))
    }

    /// `Processing` jobs whose lease expired before `now_ms`.
    pub fn list_expired_leases(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        debug_assert!(limit > 0);
        let rtxn = self.env.read_txn()?;
        let iter = self.jobs.iter(&rtxn)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
            if job.status != JobStatus::Processing {
                continue;
            }
            let Some(expires_at) = job.lease_expires_at else {
                continue;
            };
            if expires_at <= now_ms {
                out.push(job);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn counts_by_status(
        &self,
    ) -> Result<std::collections::HashMap<JobStatus, usize>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.jobs.iter(&rtxn)?;
        let mut counts = std::collections::HashMap::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
            *counts.entry(job.status).or_insert(0_usize) += 1;
        }
        Ok(counts)
    }
}
