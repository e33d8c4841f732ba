//! Orchestration layer for the redaction pipeline.
//!
//! Modules exposed here coordinate external systems (blob storage, the job
//! store, the face detector) and the polling worker that ties them together.
//! Pure transforms stay in `redact`; keep IO and state out of it.

pub mod blob_store;
pub mod detector;
pub mod jobs;
pub mod reaper;
pub mod redact;
pub mod results;
pub mod worker;

pub use blob_store::{
    BlobError, BlobMeta, BlobStore, Bucket, ByteStream, DurableWrite, FsBlobStore, PutBlob,
    bytes_stream, collect_bytes, new_blob_id, validate_blob_id,
};
pub use detector::{DetectError, Face, FaceDetector, RustfaceDetector};
pub use jobs::{Job, JobDraft, JobOutcome, JobStatus, JobStore, JobStoreError};
pub use reaper::{ReaperConfig, ReaperError, ReaperReport, reap_expired_leases};
pub use redact::{
    Redacted, RedactionConfig, decode_image, encode_image, mime_for_filename, output_filename,
    output_format_for, redact_faces,
};
pub use results::{DetectionRecord, ResultsLog, ResultsLogError};
pub use worker::{PipelineError, Worker, WorkerConfig, load_default_redaction};
