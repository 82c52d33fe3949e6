use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use lora_worker::artifact::{ArtifactCache, ArtifactPublisher};
use lora_worker::config::{
    load_effective_config, load_unvalidated_config, resolve_service_key, BlobBackend,
};
use lora_worker::error::{ConfigError, WorkerError};
use lora_worker::job::JobId;
use lora_worker::layout::JobLayout;
use lora_worker::worker::{ensure_workspace, open_bucket, WorkerLoop};

/// Claims queued LoRA training jobs and runs them one at a time.
#[derive(Parser, Debug)]
#[command(name = "lora-worker", version, propagate_version = true)]
struct Cli {
    /// JSON config file. Environment variables override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the job store and process jobs until interrupted
    Run {
        /// Process at most one job, then exit
        #[arg(long)]
        once: bool,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,

    /// Download a published artifact into the local cache and print its path
    FetchArtifact {
        #[arg(long)]
        job_id: String,

        /// Fail unless the downloaded file has exactly this many bytes
        #[arg(long)]
        expected_size: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.config.as_deref();
    let outcome = match cli.command {
        Command::Run { once } => run(config, once).await,
        Command::CheckConfig => check_config(config),
        Command::FetchArtifact {
            job_id,
            expected_size,
        } => fetch_artifact(config, &job_id, expected_size).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().with_target(true)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().json()),
        ),
    };
    if let Err(e) = installed {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }

    // Route `log` records from dependencies into tracing.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to install log bridge: {}", e);
    }
}

async fn run(path: Option<&Path>, once: bool) -> Result<(), WorkerError> {
    let config = load_effective_config(path)?;
    ensure_workspace(&config.worker.paths)?;
    info!(
        table = %config.job_store.table,
        dataset_bucket = %config.blob_store.dataset_bucket,
        artifact_bucket = config.blob_store.artifact_bucket.as_deref().unwrap_or("(local)"),
        model = %config.training.pretrained_model,
        "Configuration loaded"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::Relaxed) {
            warn!("Shutdown requested; the current job will run to completion");
        }
    })
    .map_err(|e| WorkerError::Signal(e.to_string()))?;

    let mut worker = WorkerLoop::from_config(&config, shutdown)?;
    if once {
        match worker.run_once().await? {
            Some(result) => info!(
                job_id = %result.job_id,
                success = result.success,
                "Processed one job"
            ),
            None => info!("No queued jobs"),
        }
        return Ok(());
    }
    worker.run().await
}

fn check_config(path: Option<&Path>) -> Result<(), WorkerError> {
    let config = load_effective_config(path)?;
    resolve_service_key(&config)?;
    info!(
        url = %config.job_store.url,
        table = %config.job_store.table,
        backend = ?config.blob_store.backend,
        min_images = config.dataset.min_images,
        max_images = config.dataset.max_images,
        target_samples = config.dataset.target_samples,
        rounding = ?config.dataset.rounding,
        stale_reclaim_after_secs = ?config.worker.stale_reclaim_after_secs,
        "Configuration is valid"
    );
    Ok(())
}

async fn fetch_artifact(
    path: Option<&Path>,
    raw_id: &str,
    expected_size: Option<u64>,
) -> Result<(), WorkerError> {
    let config = load_unvalidated_config(path)?;
    let bucket = config
        .blob_store
        .artifact_bucket
        .as_deref()
        .ok_or(ConfigError::Missing {
            name: "blob_store.artifact_bucket (LORA_ARTIFACT_BUCKET)",
        })?;
    let key = match config.blob_store.backend {
        BlobBackend::Local => SecretString::from(String::new()),
        BlobBackend::StorageApi => resolve_service_key(&config)?,
    };
    let store = open_bucket(&config, bucket, &key)?;

    let id = JobId::parse(raw_id)?;
    let layout = JobLayout::for_job(&config.worker.paths, &id);
    let publisher = ArtifactPublisher::new(
        None,
        &config.blob_store.artifact_prefix,
        config.artifact.min_bytes,
    );
    let object_key = publisher.key_for(&id, &layout);
    let filename = format!("{}.safetensors", layout.output_name());

    let cache = ArtifactCache::new(store, config.artifact.cache_dir.clone());
    let local = cache
        .ensure_cached(&object_key, &filename, expected_size)
        .await?;
    println!("{}", local.display());
    Ok(())
}
