//! Filesystem path helpers (XDG-aware) for LMDB, blob storage, and the results log.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

use crate::services::blob_store::Bucket;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid blob id `{blob_id}`; expected at least two hexadecimal characters")]
    InvalidBlobId { blob_id: String },
}

/// Container providing filesystem paths for the application. In production this is
/// rooted at `$XDG_DATA_HOME/velo`; tests may construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/velo`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs = ProjectDirs::from("dev", "velo", "velo").ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// LMDB environment directory for the job store (`.../lmdb/jobs`).
    pub fn jobs_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "jobs"])
    }

    /// Base directory for blob storage (`.../blobs`).
    pub fn blobs_base_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["blobs"])
    }

    /// Directory for blobs belonging to a bucket (`.../blobs/{bucket}`).
    pub fn blobs_bucket_dir(&self, bucket: Bucket) -> Result<PathBuf, PathError> {
        self.ensure_child(&["blobs", bucket.slug()])
    }

    /// Shard directory for a blob id (`.../blobs/{bucket}/{id[..2]}`).
    pub fn blob_shard_dir(&self, bucket: Bucket, blob_id: &str) -> Result<PathBuf, PathError> {
        if blob_id.len() < 2 {
            return Err(PathError::InvalidBlobId {
                blob_id: blob_id.to_owned(),
            });
        }
        let mut path = self.blobs_bucket_dir(bucket)?;
        path.push(&blob_id[..2]);
        ensure_dir(&path)?;
        Ok(path)
    }

    /// Full payload path for a blob (`.../blobs/{bucket}/{id[..2]}/{id}`).
    pub fn blob_path(&self, bucket: Bucket, blob_id: &str) -> Result<PathBuf, PathError> {
        let mut path = self.blob_shard_dir(bucket, blob_id)?;
        path.push(blob_id);
        Ok(path)
    }

    /// Append-only detection results log (`.../results/detections.jsonl`).
    pub fn results_log_path(&self) -> Result<PathBuf, PathError> {
        let mut path = self.ensure_child(&["results"])?;
        path.push("detections.jsonl");
        Ok(path)
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}
