//! Cross-cutting application constants.

/// Enlargement factor applied to detected boxes so the fill covers hairline
/// and ear overlap at the box edges.
pub const BOX_MARGIN: f64 = 1.1;

/// Default confidence threshold below which detections are discarded before
/// counting and rendering. `0.0` redacts every returned box.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.9;

/// Default delay between worker polls of the job store, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default claim lease duration, in milliseconds. A worker that dies mid-job
/// releases the job back to pending once this lease expires.
pub const DEFAULT_LEASE_MS: i64 = 120_000;

/// Maximum number of times a job may be claimed before the reaper fails it.
pub const MAX_CLAIMS: u32 = 3;
