//! HTTP surface for the redaction pipeline.
//!
//! The routes cover the boundary a front end needs: place blobs, submit a
//! job, poll its status (by job id or by the input blob id the submitter
//! holds), fetch the redacted output, and read the detection-results feed.

use std::str::FromStr;
use std::sync::Arc;
use std::{future::Future, net::SocketAddr, time::Duration};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};

use crate::config::ServerConfig;
use crate::services::blob_store::{BlobError, BlobStore, Bucket, bytes_stream};
use crate::services::jobs::{JobDraft, JobStatus, JobStore, JobStoreError};
use crate::services::redact::mime_for_filename;
use crate::services::results::{DetectionRecord, ResultsLog, ResultsLogError};

const HEALTHZ_PATH: &str = "/v1/healthz";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

/// Injected dependencies shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub results: ResultsLog,
}

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!(%err, "request failed");
        ApiError::Internal
    }
}

impl From<JobStoreError> for ApiError {
    fn from(err: JobStoreError) -> Self {
        ApiError::internal(err)
    }
}

impl From<ResultsLogError> for ApiError {
    fn from(err: ResultsLogError) -> Self {
        ApiError::internal(err)
    }
}

impl From<BlobError> for ApiError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound => ApiError::NotFound,
            BlobError::InvalidBlobId(id) => ApiError::BadRequest(format!("invalid blob id `{id}`")),
            other => ApiError::internal(other),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn build_api_router(state: AppState) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));
    debug_assert!(HEALTHZ_PATH.ends_with("healthz"));

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route("/v1/blobs/{bucket}", post(upload_blob))
        .route("/v1/blobs/output/{blob_id}", get(fetch_output_blob))
        .route("/v1/jobs", post(submit_job))
        .route("/v1/jobs/{job_id}", get(job_status))
        .route("/v1/jobs/by-input/{blob_id}", get(job_status_by_input))
        .route("/v1/results", get(results_feed))
        .with_state(state)
}

pub async fn serve(config: &ServerConfig, state: AppState) -> Result<(), ServerError> {
    debug_assert!(config.listen_addr.len() <= 128);
    debug_assert!(!config.listen_addr.contains('\n'));

    let listen_addr = parse_listen_addr(&config.listen_addr)?;

    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "velo server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);

    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_api_router(state);

    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    blob_id: String,
}

/// Raw-body upload into the input bucket. Only the worker writes outputs.
async fn upload_blob(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<UploadParams>,
    body: axum::body::Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    let bucket = Bucket::from_str(&bucket)
        .map_err(|_| ApiError::BadRequest(format!("unknown bucket `{bucket}`")))?;
    if bucket != Bucket::Input {
        return Err(ApiError::BadRequest(
            "only the input bucket accepts uploads".to_string(),
        ));
    }
    if params.filename.trim().is_empty() {
        return Err(ApiError::BadRequest("filename must not be empty".to_string()));
    }

    let put = state
        .blobs
        .put(
            bucket,
            &params.filename,
            bytes_stream(body.to_vec()),
            serde_json::Map::new(),
        )
        .await?;

    Ok(Json(UploadResponse {
        blob_id: put.blob_id,
    }))
}

async fn fetch_output_blob(
    State(state): State<AppState>,
    Path(blob_id): Path<String>,
) -> Result<Response, ApiError> {
    let meta = state
        .blobs
        .head(Bucket::Output, &blob_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let stream = state.blobs.get(Bucket::Output, &blob_id).await?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime_for_filename(&meta.filename))
        .header(header::CONTENT_LENGTH, meta.size_bytes)
        .body(Body::from_stream(stream))
        .map_err(ApiError::internal)?;
    Ok(response)
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: String,
}

/// Create a pending job. The submitter must have placed the referenced blobs
/// beforehand; a missing blob surfaces later as a job failure.
async fn submit_job(
    State(state): State<AppState>,
    Json(draft): Json<JobDraft>,
) -> Result<Json<SubmitResponse>, ApiError> {
    if draft.input_blob_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "input_blob_id must not be empty".to_string(),
        ));
    }
    if draft.filename.trim().is_empty() {
        return Err(ApiError::BadRequest("filename must not be empty".to_string()));
    }

    let job = state.jobs.create(draft)?;
    tracing::info!(job_id = %job.id, input_blob_id = %job.input_blob_id, "job submitted");
    Ok(Json(SubmitResponse { job_id: job.id }))
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_blob_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.jobs.get(&job_id)?.ok_or(ApiError::NotFound)?;
    Ok(Json(JobStatusResponse {
        status: job.status,
        output_blob_id: job.output_blob_id,
        error: job.error,
    }))
}

/// Status lookup by the input blob id the submitter holds.
async fn job_status_by_input(
    State(state): State<AppState>,
    Path(blob_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .jobs
        .find_by_input_blob(&blob_id)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(JobStatusResponse {
        status: job.status,
        output_blob_id: job.output_blob_id,
        error: job.error,
    }))
}

async fn results_feed(
    State(state): State<AppState>,
) -> Result<Json<Vec<DetectionRecord>>, ApiError> {
    let records = state.results.read_all().await?;
    Ok(Json(records))
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            debug_assert!(event != ShutdownEvent::Pending);
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        } else {
            // Sender dropped without an event; never force termination.
            std::future::pending::<()>().await;
        }
    }
}
