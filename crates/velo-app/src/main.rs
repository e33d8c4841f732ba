use std::process;
use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{filter::LevelFilter, fmt};

use velo_app::cli::{Cli, Commands, JobsArgs, JobsCommands, JobsStatusFormat};
use velo_app::config;
use velo_app::error::AppError;
use velo_app::paths::AppPaths;
use velo_app::server::{self, AppState};
use velo_app::services::{
    BlobStore, FsBlobStore, JobStatus, JobStore, ReaperConfig, ResultsLog, RustfaceDetector,
    Worker, WorkerConfig, load_default_redaction, reap_expired_leases,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let config = config::load()?;
            let state = build_state(&config)?;
            server::serve(&config.server, state).await?;
        }
        Some(Commands::Worker(_)) => {
            let config = config::load()?;
            run_worker(&config).await?;
        }
        Some(Commands::Jobs(args)) => {
            let config = config::load()?;
            run_jobs(&config, args).await?;
        }
        None => {
            Cli::print_help();
        }
    }
    Ok(())
}

fn build_state(config: &config::AppConfig) -> Result<AppState, AppError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let jobs = Arc::new(JobStore::open(&paths)?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::builder().paths(paths.clone()).build());
    let results = ResultsLog::open(&paths)?;
    Ok(AppState {
        jobs,
        blobs,
        results,
    })
}

async fn run_worker(config: &config::AppConfig) -> Result<(), AppError> {
    let model_path = config.detector.model_path.as_deref().ok_or_else(|| {
        AppError::Config(
            "detector.model_path must point at a SeetaFace model (VELO__DETECTOR__MODEL_PATH)"
                .to_string(),
        )
    })?;
    let detector = Arc::new(RustfaceDetector::from_model_path(model_path)?);

    let state = build_state(config)?;
    let default_redaction = load_default_redaction(config.worker.redaction_image.as_deref());

    let worker = Worker::new(
        state.jobs,
        state.blobs,
        detector,
        state.results,
        default_redaction,
        WorkerConfig::from(&config.worker),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    worker.run(shutdown_rx).await;
    Ok(())
}

async fn run_jobs(config: &config::AppConfig, args: JobsArgs) -> Result<(), AppError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let store = JobStore::open(&paths)?;

    match args.command {
        JobsCommands::Status(status_args) => {
            let counts = store.counts_by_status()?;
            let ordered = [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Failed,
            ];
            match status_args.format {
                JobsStatusFormat::Json => {
                    let mut map = serde_json::Map::new();
                    for status in ordered {
                        let key = serde_json::to_value(status)?
                            .as_str()
                            .unwrap_or("unknown")
                            .to_string();
                        map.insert(
                            key,
                            serde_json::Value::from(counts.get(&status).copied().unwrap_or(0)),
                        );
                    }
                    println!("{}", serde_json::Value::Object(map));
                }
                JobsStatusFormat::Table => {
                    for status in ordered {
                        println!(
                            "{:<12} {}",
                            format!("{status:?}").to_lowercase(),
                            counts.get(&status).copied().unwrap_or(0)
                        );
                    }
                }
            }
        }
        JobsCommands::Reap(reap_args) => {
            if reap_args.dry_run {
                let expired = store.list_expired_leases(now_ms(), 1000)?;
                for job in &expired {
                    println!("{} (claims: {})", job.id, job.claim_count);
                }
                println!("{} expired lease(s); no changes made", expired.len());
            } else {
                let report = reap_expired_leases(&store, &ReaperConfig::default())?;
                println!(
                    "requeued: {}, failed: {}, skipped: {}",
                    report.requeued.len(),
                    report.failed.len(),
                    report.skipped
                );
            }
        }
    }
    Ok(())
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
