use std::pin::Pin;

use bytes::Bytes;
use futures::stream::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use strum::{AsRefStr, EnumIter, EnumString};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::paths::AppPaths;
use crate::services::jobs::current_timestamp_ms;

// Blob storage abstractions.
//
// Blobs are immutable byte payloads addressed by an opaque id. Every `put`
// mints a fresh id; a "changed" blob is a new blob. Buckets are independent
// namespaces: an id stored under `input` is never resolvable under `output`.

/// Boxed asynchronous byte stream returned/accepted by the blob store.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobError>> + Send>>;

/// Storage namespaces. Uploads land in `input`; only the worker writes `output`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Input,
    Output,
}

impl Bucket {
    pub fn slug(self) -> &'static str {
        match self {
            Bucket::Input => "input",
            Bucket::Output => "output",
        }
    }
}

/// Metadata persisted alongside every blob payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub blob_id: String,
    pub filename: String,
    pub size_bytes: u64,
    /// Lowercase-hex BLAKE3 of the payload, computed while streaming.
    pub checksum: String,
    pub metadata: JsonMap<String, JsonValue>,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// Result returned by `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutBlob {
    pub blob_id: String,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("not found")]
    NotFound,

    #[error("invalid blob id: {0}")]
    InvalidBlobId(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("stream error: {0}")]
    Stream(String),
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e.to_string())
    }
}

/// Mint a fresh blob id: 32 lowercase hex characters.
pub fn new_blob_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Validate a candidate blob id: non-empty lowercase hex, long enough to shard.
pub fn validate_blob_id(blob_id: &str) -> Result<(), BlobError> {
    if blob_id.len() < 2 {
        return Err(BlobError::InvalidBlobId(blob_id.to_string()));
    }
    if !blob_id
        .chars()
        .all(|c: char| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(BlobError::InvalidBlobId(blob_id.to_string()));
    }
    Ok(())
}

/// Wrap an in-memory buffer as a single-chunk `ByteStream`.
pub fn bytes_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(futures::stream::iter(vec![Ok(Bytes::from(data))]))
}

/// Drain a `ByteStream` into a contiguous buffer.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Vec<u8>, BlobError> {
    let mut out = Vec::new();
    while let Some(chunk_res) = stream.as_mut().next().await {
        let chunk = chunk_res?;
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Trait abstracting over blob storage backends.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the provided byte stream into `bucket` under a freshly minted id
    /// and return it. Existing blobs are never overwritten.
    async fn put(
        &self,
        bucket: Bucket,
        filename: &str,
        data: ByteStream,
        metadata: JsonMap<String, JsonValue>,
    ) -> Result<PutBlob, BlobError>;

    /// Return a byte stream for the given `blob_id` or `BlobError::NotFound`.
    async fn get(&self, bucket: Bucket, blob_id: &str) -> Result<ByteStream, BlobError>;

    /// Return metadata for `blob_id` if present in `bucket`.
    async fn head(&self, bucket: Bucket, blob_id: &str) -> Result<Option<BlobMeta>, BlobError>;
}

/// Durability policy for filesystem writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurableWrite {
    /// No explicit fsync (fastest, least durable).
    None,
    /// Fsync the payload file only.
    FileOnly,
    /// Fsync payload and parent directory.
    FileAndDir,
}

/// Filesystem blob store implementation using the AppPaths layout.
///
/// Write strategy:
/// - Temp file in the data dir, hard-linked into the shard (rename fallback
///   on cross-device setups). A link failing with EEXIST means an id
///   collision and is surfaced as an error, never an overwrite.
/// - Checksum-on-write: BLAKE3 computed while streaming.
/// - Size verification: streamed byte count compared to file metadata.
/// - The JSON metadata sidecar lands before the payload, so a resolvable
///   payload always has metadata.
///
/// Read strategy:
/// - Stream directly from the final blob path in fixed-size chunks.
#[derive(Debug, Clone, bon::Builder)]
pub struct FsBlobStore {
    paths: AppPaths,
    #[builder(default = 65536)]
    chunk_size_bytes: usize,
    #[builder(default = DurableWrite::None)]
    durability: DurableWrite,
}

impl FsBlobStore {
    fn sidecar_path(&self, bucket: Bucket, blob_id: &str) -> Result<std::path::PathBuf, BlobError> {
        let mut path = self
            .paths
            .blob_shard_dir(bucket, blob_id)
            .map_err(|e| BlobError::Io(e.to_string()))?;
        path.push(format!("{blob_id}.json"));
        Ok(path)
    }

    async fn fsync_file(&self, file: &mut fs::File) -> Result<(), BlobError> {
        file.sync_all()
            .await
            .map_err(|e| BlobError::Io(format!("fsync file: {}", e)))
    }

    /// Fsync a directory by opening and syncing it. Best-effort; some
    /// platforms do not support it.
    async fn fsync_dir(&self, dir_path: &std::path::Path) {
        match fs::File::open(dir_path).await {
            Ok(dir_file) => {
                if let Err(e) = dir_file.sync_all().await {
                    tracing::warn!("directory fsync unsupported or failed: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("failed to open directory for fsync: {}", e);
            }
        }
    }

    /// Finalize by hard linking temp to the final path; fall back to rename
    /// when the link crosses devices. EEXIST means another blob already owns
    /// this id, which must never happen for freshly minted ids.
    async fn finalize_atomic(
        &self,
        temp_path: &std::path::Path,
        final_path: &std::path::Path,
    ) -> Result<(), BlobError> {
        const EXDEV: i32 = 18;

        match tokio::task::spawn_blocking({
            let temp = temp_path.to_path_buf();
            let final_p = final_path.to_path_buf();
            move || std::fs::hard_link(&temp, &final_p)
        })
        .await
        {
            Ok(Ok(())) => {
                let _ = fs::remove_file(temp_path).await;
                return Ok(());
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(temp_path).await;
                return Err(BlobError::Io(format!(
                    "blob id collision at {}",
                    final_path.display()
                )));
            }
            Ok(Err(e)) if e.raw_os_error() == Some(EXDEV) => {
                // Cross-device; fall through to rename.
            }
            Ok(Err(e)) => {
                return Err(BlobError::Io(format!("hard link failed: {}", e)));
            }
            Err(e) => {
                return Err(BlobError::Io(format!("hard link task failed: {}", e)));
            }
        }

        fs::rename(temp_path, final_path)
            .await
            .map_err(|e| BlobError::Io(format!("rename failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        bucket: Bucket,
        filename: &str,
        mut data: ByteStream,
        metadata: JsonMap<String, JsonValue>,
    ) -> Result<PutBlob, BlobError> {
        let blob_id = new_blob_id();

        // Stream to a temp file, computing checksum and size as we go.
        let temp_dir = self.paths.data_dir();
        let temp_file = tempfile::NamedTempFile::new_in(&temp_dir)
            .map_err(|e| BlobError::Io(format!("create temp file: {}", e)))?;
        let temp_path = temp_file.path().to_path_buf();

        let mut file = fs::File::from_std(
            temp_file
                .reopen()
                .map_err(|e| BlobError::Io(format!("reopen temp file: {}", e)))?,
        );

        let mut hasher = blake3::Hasher::new();
        let mut total_bytes: u64 = 0;

        while let Some(chunk_res) = data.next().await {
            let chunk = chunk_res.map_err(|e| BlobError::Stream(e.to_string()))?;
            total_bytes = total_bytes
                .checked_add(chunk.len() as u64)
                .ok_or_else(|| BlobError::Io("size overflow".to_string()))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| BlobError::Io(format!("write chunk: {}", e)))?;
        }

        match self.durability {
            DurableWrite::FileOnly | DurableWrite::FileAndDir => {
                self.fsync_file(&mut file).await?;
            }
            DurableWrite::None => {}
        }

        drop(file);

        let checksum = hasher.finalize().to_hex().to_string();

        // Verify the size on disk matches what we streamed.
        let disk_meta = fs::metadata(&temp_path)
            .await
            .map_err(|e| BlobError::Io(format!("stat temp file: {}", e)))?;
        if disk_meta.len() != total_bytes {
            let _ = fs::remove_file(&temp_path).await;
            return Err(BlobError::Io(format!(
                "size mismatch: wrote {} bytes, file is {}",
                total_bytes,
                disk_meta.len()
            )));
        }

        let final_path = self
            .paths
            .blob_path(bucket, &blob_id)
            .map_err(|e| BlobError::Io(e.to_string()))?;
        let shard_dir = final_path
            .parent()
            .ok_or_else(|| BlobError::Io("blob path has no parent".to_string()))?
            .to_path_buf();

        // Sidecar first: a resolvable payload must always have metadata.
        let meta = BlobMeta {
            blob_id: blob_id.clone(),
            filename: filename.to_string(),
            size_bytes: total_bytes,
            checksum: checksum.clone(),
            metadata,
            created_at: current_timestamp_ms(),
        };
        let sidecar = self.sidecar_path(bucket, &blob_id)?;
        let encoded = serde_json::to_vec(&meta)
            .map_err(|e| BlobError::Io(format!("encode blob metadata: {}", e)))?;
        fs::write(&sidecar, &encoded)
            .await
            .map_err(|e| BlobError::Io(format!("write blob metadata: {}", e)))?;

        if let Err(err) = self.finalize_atomic(&temp_path, &final_path).await {
            let _ = fs::remove_file(&sidecar).await;
            return Err(err);
        }

        if self.durability == DurableWrite::FileAndDir {
            self.fsync_dir(&shard_dir).await;
        }

        Ok(PutBlob {
            blob_id,
            size_bytes: total_bytes,
            checksum,
        })
    }

    async fn get(&self, bucket: Bucket, blob_id: &str) -> Result<ByteStream, BlobError> {
        validate_blob_id(blob_id)?;
        let path = self
            .paths
            .blob_path(bucket, blob_id)
            .map_err(|e| BlobError::Io(e.to_string()))?;

        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound
            } else {
                BlobError::Io(format!("open blob: {}", e))
            }
        })?;

        let chunk_size = self.chunk_size_bytes;
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = file.read(&mut buf).await.map_err(|e| BlobError::Io(format!("read: {}", e)))?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    async fn head(&self, bucket: Bucket, blob_id: &str) -> Result<Option<BlobMeta>, BlobError> {
        validate_blob_id(blob_id)?;
        let sidecar = self.sidecar_path(bucket, blob_id)?;

        match fs::read(&sidecar).await {
            Ok(raw) => {
                let meta: BlobMeta = serde_json::from_slice(&raw)
                    .map_err(|e| BlobError::Io(format!("decode blob metadata: {}", e)))?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io(format!("read blob metadata: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> FsBlobStore {
        let paths = AppPaths::new(temp.path()).expect("paths");
        FsBlobStore::builder().paths(paths).build()
    }

    #[tokio::test]
    async fn put_get_head_roundtrip() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);

        let mut metadata = JsonMap::new();
        metadata.insert("source".into(), JsonValue::from("upload"));

        let put = store
            .put(
                Bucket::Input,
                "selfie.jpg",
                bytes_stream(b"hello world".to_vec()),
                metadata,
            )
            .await
            .expect("put");
        assert_eq!(put.size_bytes, 11);
        assert_eq!(put.checksum, blake3::hash(b"hello world").to_hex().to_string());

        let meta = store
            .head(Bucket::Input, &put.blob_id)
            .await
            .expect("head")
            .expect("meta present");
        assert_eq!(meta.filename, "selfie.jpg");
        assert_eq!(meta.size_bytes, 11);
        assert_eq!(meta.metadata.get("source"), Some(&JsonValue::from("upload")));

        let stream = store.get(Bucket::Input, &put.blob_id).await.expect("get");
        let collected = collect_bytes(stream).await.expect("collect");
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn buckets_are_independent_namespaces() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);

        let put = store
            .put(
                Bucket::Input,
                "a.png",
                bytes_stream(b"payload".to_vec()),
                JsonMap::new(),
            )
            .await
            .expect("put");

        let other = store.get(Bucket::Output, &put.blob_id).await;
        assert!(matches!(other, Err(BlobError::NotFound)));
        let other_head = store
            .head(Bucket::Output, &put.blob_id)
            .await
            .expect("head");
        assert!(other_head.is_none());
    }

    #[tokio::test]
    async fn repeated_put_of_same_bytes_mints_new_ids() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);

        let first = store
            .put(
                Bucket::Input,
                "a.png",
                bytes_stream(b"same".to_vec()),
                JsonMap::new(),
            )
            .await
            .expect("first put");
        let second = store
            .put(
                Bucket::Input,
                "a.png",
                bytes_stream(b"same".to_vec()),
                JsonMap::new(),
            )
            .await
            .expect("second put");

        assert_ne!(first.blob_id, second.blob_id);
        assert_eq!(first.checksum, second.checksum);
    }

    #[tokio::test]
    async fn invalid_blob_id_rejections() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);

        for bad in ["", "a", "AB", "gg"] {
            let got = store.get(Bucket::Input, bad).await;
            assert!(
                matches!(got, Err(BlobError::InvalidBlobId(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);

        let fake = "abcdef1234567890abcdef1234567890";
        assert!(matches!(
            store.get(Bucket::Output, fake).await,
            Err(BlobError::NotFound)
        ));
        assert!(store.head(Bucket::Output, fake).await.expect("head").is_none());
    }

    #[tokio::test]
    async fn empty_payload_roundtrips() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);

        let put = store
            .put(Bucket::Input, "empty.png", bytes_stream(Vec::new()), JsonMap::new())
            .await
            .expect("put");
        assert_eq!(put.size_bytes, 0);

        let collected = collect_bytes(store.get(Bucket::Input, &put.blob_id).await.expect("get"))
            .await
            .expect("collect");
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn minted_ids_validate_and_shard() {
        let id = new_blob_id();
        assert_eq!(id.len(), 32);
        validate_blob_id(&id).expect("minted ids are valid");
    }
}
