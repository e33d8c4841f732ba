use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::MAX_CLAIMS;
use crate::services::jobs::{JobStore, JobStoreError, current_timestamp_ms};

// Lease recovery for crashed workers.
//
// A worker that dies mid-job leaves the job in `Processing` with a lease.
// Once the lease expires the job is returned to `Pending` so another worker
// can pick it up. Jobs that keep getting claimed and never finish are failed
// after `MAX_CLAIMS` attempts instead of cycling forever.

/// Configuration for the stale job reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Maximum number of claims before an expired-lease job is failed.
    pub max_claims: u32,
    /// Upper bound on jobs examined per run.
    pub batch_limit: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_claims: MAX_CLAIMS,
            batch_limit: 1000,
        }
    }
}

/// Report of reaper execution results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperReport {
    /// Jobs returned to pending for another attempt.
    pub requeued: Vec<String>,
    /// Jobs failed after exhausting their claims.
    pub failed: Vec<String>,
    /// Jobs another actor finished or reclaimed while we looked at them.
    pub skipped: usize,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty() && self.skipped == 0
    }

    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len() + self.skipped
    }
}

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("reaper configuration invalid: {0}")]
    InvalidConfig(String),
}

/// Reap `Processing` jobs whose lease has expired.
pub fn reap_expired_leases(
    store: &JobStore,
    config: &ReaperConfig,
) -> Result<ReaperReport, ReaperError> {
    if config.batch_limit == 0 {
        return Err(ReaperError::InvalidConfig(
            "batch limit must be positive".to_string(),
        ));
    }

    let mut report = ReaperReport {
        requeued: Vec::new(),
        failed: Vec::new(),
        skipped: 0,
    };

    let expired = store.list_expired_leases(current_timestamp_ms(), config.batch_limit)?;

    for job in expired {
        if job.claim_count >= config.max_claims {
            match store.fail(
                &job.id,
                format!(
                    "abandoned after {} claim attempts (lease expired)",
                    job.claim_count
                ),
            ) {
                Ok(_) => report.failed.push(job.id),
                Err(JobStoreError::TerminalState { .. }) => {
                    report.skipped = report.skipped.saturating_add(1);
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            match store.requeue(&job.id)? {
                Some(_) => report.requeued.push(job.id),
                None => report.skipped = report.skipped.saturating_add(1),
            }
        }
    }

    Ok(report)
}
