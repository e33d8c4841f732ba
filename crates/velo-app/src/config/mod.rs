//! Configuration loading and XDG path helpers.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{DEFAULT_LEASE_MS, DEFAULT_MIN_CONFIDENCE, DEFAULT_POLL_INTERVAL_MS};

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub worker: WorkerSettings,
    pub detector: DetectorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    /// Identity stamped onto claimed jobs. Defaults to `worker-{pid}`.
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub lease_ms: i64,
    /// Detections below this confidence are discarded before counting and
    /// rendering. Set to 0.0 to redact every returned box.
    pub min_confidence: f64,
    /// Optional path to an image used to cover faces instead of a solid
    /// rectangle. Unreadable or undecodable files fall back to rectangles.
    pub redaction_image: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    /// Path to the SeetaFace frontal model consumed by rustface.
    pub model_path: Option<PathBuf>,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .set_default("worker.worker_id", default_worker_id())?
        .set_default("worker.poll_interval_ms", DEFAULT_POLL_INTERVAL_MS)?
        .set_default("worker.lease_ms", DEFAULT_LEASE_MS)?
        .set_default("worker.min_confidence", DEFAULT_MIN_CONFIDENCE)?
        .set_default("worker.redaction_image", None::<String>)?
        .set_default("detector.model_path", None::<String>)?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("VELO").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "velo", "velo").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}
