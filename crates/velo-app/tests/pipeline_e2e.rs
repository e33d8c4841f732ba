use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Map as JsonMap;
use tempfile::TempDir;

use velo_app::paths::AppPaths;
use velo_app::services::blob_store::{Bucket, FsBlobStore, bytes_stream, collect_bytes};
use velo_app::services::detector::{DetectError, Face, FaceDetector};
use velo_app::services::jobs::{JobDraft, JobStatus, JobStore};
use velo_app::services::redact::RedactionConfig;
use velo_app::services::results::ResultsLog;
use velo_app::services::worker::{Worker, WorkerConfig};
use velo_app::services::BlobStore;

struct FixedDetector(Vec<Face>);

impl FaceDetector for FixedDetector {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<Face>, DetectError> {
        Ok(self.0.clone())
    }
}

struct FailingDetector;

impl FaceDetector for FailingDetector {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<Face>, DetectError> {
        Err(DetectError::new("model unavailable"))
    }
}

struct Harness {
    _temp: TempDir,
    jobs: Arc<JobStore>,
    blobs: Arc<dyn BlobStore>,
    results: ResultsLog,
    worker: Worker,
}

fn harness(detector: Arc<dyn FaceDetector>, default_redaction: RedactionConfig) -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("paths");
    let jobs = Arc::new(JobStore::open(&paths).expect("open store"));
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::builder().paths(paths.clone()).build());
    let results = ResultsLog::open(&paths).expect("open results log");

    let worker = Worker::new(
        Arc::clone(&jobs),
        Arc::clone(&blobs),
        detector,
        results.clone(),
        default_redaction,
        WorkerConfig {
            worker_id: "worker-test".to_string(),
            poll_interval: Duration::from_millis(10),
            lease_ms: 60_000,
            min_confidence: 0.9,
        },
    );

    Harness {
        _temp: temp,
        jobs,
        blobs,
        results,
        worker,
    }
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([120, 130, 140]));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).expect("encode png");
    buf.into_inner()
}

fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb(color));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).expect("encode png");
    buf.into_inner()
}

async fn upload(harness: &Harness, filename: &str, bytes: Vec<u8>) -> String {
    harness
        .blobs
        .put(Bucket::Input, filename, bytes_stream(bytes), JsonMap::new())
        .await
        .expect("upload blob")
        .blob_id
}

fn submit(harness: &Harness, input_blob_id: &str, filename: &str, cover: Option<String>) -> String {
    harness
        .jobs
        .create(JobDraft {
            input_blob_id: input_blob_id.to_string(),
            filename: filename.to_string(),
            cover_blob_id: cover,
        })
        .expect("create job")
        .id
}

#[tokio::test]
async fn worker_completes_a_rectangle_job_end_to_end() {
    let detector = Arc::new(FixedDetector(vec![Face {
        x: 30,
        y: 30,
        width: 40,
        height: 40,
        confidence: 0.99,
    }]));
    let harness = harness(detector, RedactionConfig::black());

    let input_blob_id = upload(&harness, "portrait.png", png_bytes(100, 100)).await;
    let job_id = submit(&harness, &input_blob_id, "portrait.png", None);

    let processed = harness.worker.process_pending().await.expect("tick");
    assert_eq!(processed, 1);

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.num_faces, 1);
    assert_eq!(job.confidence_scores, vec![0.99]);
    assert!(job.processing_time >= 0.0);
    assert!(job.completed_at.is_some());
    assert!(job.error.is_none());

    // The output blob decodes, carries the expected name, and is redacted.
    let output_blob_id = job.output_blob_id.expect("output blob id");
    let meta = harness
        .blobs
        .head(Bucket::Output, &output_blob_id)
        .await
        .expect("head")
        .expect("meta present");
    assert_eq!(meta.filename, "portrait_redacted.png");
    assert_eq!(
        meta.metadata.get("input_blob_id").and_then(|v| v.as_str()),
        Some(input_blob_id.as_str())
    );
    assert_eq!(
        meta.metadata.get("num_faces").and_then(|v| v.as_u64()),
        Some(1)
    );
    assert!(meta.metadata.contains_key("processing_time"));

    let bytes = collect_bytes(
        harness
            .blobs
            .get(Bucket::Output, &output_blob_id)
            .await
            .expect("get output"),
    )
    .await
    .expect("collect output");
    let output = image::load_from_memory(&bytes).expect("decode output").to_rgb8();
    assert_eq!(output.dimensions(), (100, 100));
    assert_eq!(*output.get_pixel(35, 35), Rgb([0, 0, 0]));
    assert_eq!(*output.get_pixel(0, 0), Rgb([120, 130, 140]));

    // Step (h): the denormalized feed got its record.
    let records = harness.results.read_all().await.expect("read results");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].filename, "portrait.png");
    assert_eq!(records[0].num_faces, 1);
    assert_eq!(records[0].confidence_scores, vec![0.99]);
}

#[tokio::test]
async fn gating_counts_only_high_confidence_faces() {
    let detector = Arc::new(FixedDetector(vec![
        Face {
            x: 10,
            y: 10,
            width: 20,
            height: 20,
            confidence: 0.99,
        },
        Face {
            x: 60,
            y: 60,
            width: 20,
            height: 20,
            confidence: 0.5,
        },
    ]));
    let harness = harness(detector, RedactionConfig::black());

    let input_blob_id = upload(&harness, "pair.png", png_bytes(100, 100)).await;
    let job_id = submit(&harness, &input_blob_id, "pair.png", None);

    harness.worker.process_pending().await.expect("tick");

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.num_faces, 1);
    assert_eq!(job.confidence_scores, vec![0.99]);

    let bytes = collect_bytes(
        harness
            .blobs
            .get(Bucket::Output, job.output_blob_id.as_deref().expect("output"))
            .await
            .expect("get output"),
    )
    .await
    .expect("collect");
    let output = image::load_from_memory(&bytes).expect("decode").to_rgb8();
    assert_eq!(*output.get_pixel(10, 10), Rgb([0, 0, 0]));
    // The low-confidence box is visibly untouched.
    assert_eq!(*output.get_pixel(60, 60), Rgb([120, 130, 140]));
}

#[tokio::test]
async fn detection_error_fails_the_job_with_verbatim_message() {
    let harness = harness(Arc::new(FailingDetector), RedactionConfig::black());

    let input_blob_id = upload(&harness, "portrait.png", png_bytes(50, 50)).await;
    let job_id = submit(&harness, &input_blob_id, "portrait.png", None);

    harness.worker.process_pending().await.expect("tick");

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("model unavailable"));
    assert!(job.output_blob_id.is_none());
    assert!(job.completed_at.is_some());

    // No output blob and no results record were produced.
    let records = harness.results.read_all().await.expect("read results");
    assert!(records.is_empty());
}

#[tokio::test]
async fn undecodable_input_fails_the_job() {
    let detector = Arc::new(FixedDetector(vec![]));
    let harness = harness(detector, RedactionConfig::black());

    let input_blob_id = upload(&harness, "junk.png", b"definitely not an image".to_vec()).await;
    let job_id = submit(&harness, &input_blob_id, "junk.png", None);

    harness.worker.process_pending().await.expect("tick");

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error
            .as_deref()
            .expect("error")
            .starts_with("failed to decode image"),
        "unexpected error: {:?}",
        job.error
    );
}

#[tokio::test]
async fn missing_input_blob_fails_the_job() {
    let detector = Arc::new(FixedDetector(vec![]));
    let harness = harness(detector, RedactionConfig::black());

    let job_id = submit(
        &harness,
        "00000000000000000000000000000000",
        "ghost.png",
        None,
    );

    harness.worker.process_pending().await.expect("tick");

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().expect("error").contains("not found"));
}

#[tokio::test]
async fn one_failing_job_never_aborts_the_batch() {
    let detector = Arc::new(FixedDetector(vec![Face {
        x: 5,
        y: 5,
        width: 10,
        height: 10,
        confidence: 0.99,
    }]));
    let harness = harness(detector, RedactionConfig::black());

    let bad_job = submit(
        &harness,
        "00000000000000000000000000000000",
        "ghost.png",
        None,
    );
    let input_blob_id = upload(&harness, "ok.png", png_bytes(40, 40)).await;
    let good_job = submit(&harness, &input_blob_id, "ok.png", None);

    let processed = harness.worker.process_pending().await.expect("tick");
    assert_eq!(processed, 2);

    let bad = harness.jobs.get(&bad_job).expect("get").expect("present");
    let good = harness.jobs.get(&good_job).expect("get").expect("present");
    assert_eq!(bad.status, JobStatus::Failed);
    assert_eq!(good.status, JobStatus::Completed);
}

#[tokio::test]
async fn per_job_cover_overrides_the_default_redaction() {
    let detector = Arc::new(FixedDetector(vec![Face {
        x: 10,
        y: 10,
        width: 20,
        height: 20,
        confidence: 0.99,
    }]));
    let harness = harness(detector, RedactionConfig::black());

    let input_blob_id = upload(&harness, "portrait.png", png_bytes(100, 100)).await;
    let cover_blob_id = upload(&harness, "cover.png", solid_png(8, 8, [200, 10, 10])).await;
    let job_id = submit(
        &harness,
        &input_blob_id,
        "portrait.png",
        Some(cover_blob_id),
    );

    harness.worker.process_pending().await.expect("tick");

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Completed);

    let bytes = collect_bytes(
        harness
            .blobs
            .get(Bucket::Output, job.output_blob_id.as_deref().expect("output"))
            .await
            .expect("get output"),
    )
    .await
    .expect("collect");
    let output = image::load_from_memory(&bytes).expect("decode").to_rgb8();
    assert_eq!(*output.get_pixel(15, 15), Rgb([200, 10, 10]));
    assert_eq!(*output.get_pixel(50, 50), Rgb([120, 130, 140]));
}

#[tokio::test]
async fn undecodable_cover_falls_back_to_black_rectangles() {
    let detector = Arc::new(FixedDetector(vec![Face {
        x: 10,
        y: 10,
        width: 20,
        height: 20,
        confidence: 0.99,
    }]));
    let harness = harness(detector, RedactionConfig::black());

    let input_blob_id = upload(&harness, "portrait.png", png_bytes(100, 100)).await;
    let cover_blob_id = upload(&harness, "cover.bin", b"not an image".to_vec()).await;
    let job_id = submit(
        &harness,
        &input_blob_id,
        "portrait.png",
        Some(cover_blob_id),
    );

    harness.worker.process_pending().await.expect("tick");

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Completed);

    let bytes = collect_bytes(
        harness
            .blobs
            .get(Bucket::Output, job.output_blob_id.as_deref().expect("output"))
            .await
            .expect("get output"),
    )
    .await
    .expect("collect");
    let output = image::load_from_memory(&bytes).expect("decode").to_rgb8();
    assert_eq!(*output.get_pixel(15, 15), Rgb([0, 0, 0]));
}

#[tokio::test]
async fn missing_cover_blob_fails_the_job() {
    let detector = Arc::new(FixedDetector(vec![]));
    let harness = harness(detector, RedactionConfig::black());

    let input_blob_id = upload(&harness, "portrait.png", png_bytes(40, 40)).await;
    let job_id = submit(
        &harness,
        &input_blob_id,
        "portrait.png",
        Some("00000000000000000000000000000000".to_string()),
    );

    harness.worker.process_pending().await.expect("tick");

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().expect("error").contains("not found"));
}

#[tokio::test]
async fn jpeg_inputs_produce_jpeg_outputs() {
    let detector = Arc::new(FixedDetector(vec![]));
    let harness = harness(detector, RedactionConfig::black());

    // The stored payload is PNG; the declared filename drives the output encoding.
    let input_blob_id = upload(&harness, "photo.jpg", png_bytes(30, 30)).await;
    let job_id = submit(&harness, &input_blob_id, "photo.jpg", None);

    harness.worker.process_pending().await.expect("tick");

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.num_faces, 0);

    let output_blob_id = job.output_blob_id.expect("output");
    let meta = harness
        .blobs
        .head(Bucket::Output, &output_blob_id)
        .await
        .expect("head")
        .expect("meta");
    assert_eq!(meta.filename, "photo_redacted.jpg");

    let bytes = collect_bytes(
        harness
            .blobs
            .get(Bucket::Output, &output_blob_id)
            .await
            .expect("get"),
    )
    .await
    .expect("collect");
    assert_eq!(
        image::guess_format(&bytes).expect("format"),
        ImageFormat::Jpeg
    );
}

#[tokio::test]
async fn already_claimed_jobs_are_skipped() {
    let detector = Arc::new(FixedDetector(vec![]));
    let harness = harness(detector, RedactionConfig::black());

    let input_blob_id = upload(&harness, "portrait.png", png_bytes(20, 20)).await;
    let job_id = submit(&harness, &input_blob_id, "portrait.png", None);

    // Another worker claimed between our snapshot and our claim.
    harness
        .jobs
        .claim(&job_id, "worker-other", 60_000)
        .expect("other claim");

    let processed = harness.worker.process_pending().await.expect("tick");
    assert_eq!(processed, 0);

    let job = harness.jobs.get(&job_id).expect("get").expect("present");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("worker-other"));
}
