//! The single poll loop: claim, process, reap, repeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::blob::{BlobError, BlobStore, LocalBlobStore, StorageApiBlobStore};
use crate::config::{resolve_service_key, BlobBackend, WorkerConfig};
use crate::error::WorkerError;
use crate::job::{JobLedger, LedgerSettings};
use crate::layout::WorkspacePaths;
use crate::pipeline::{JobContext, Pipeline, PipelineConfig, ProgressReporter, StoreProgress};
use crate::store::{ColumnNames, JobStoreClient, JobTable, PostgrestTable, StoreError};

use super::claimer::Claimer;
use super::job::JobResult;
use super::reaper::Reaper;

/// Longest stretch the loop sleeps without looking at the shutdown flag.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(250);

/// The remote systems a worker talks to.
pub struct WorkerBackends {
    pub table: Arc<dyn JobTable>,
    pub dataset_blobs: Arc<dyn BlobStore>,
    /// Unset when artifacts stay on local disk.
    pub artifact_blobs: Option<Arc<dyn BlobStore>>,
}

impl WorkerBackends {
    /// Production backends: the REST job store plus the configured blob backend.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let key = resolve_service_key(config)?;
        let table = PostgrestTable::new(
            &config.job_store.url,
            &config.job_store.table,
            SecretString::from(key.expose_secret()),
            Duration::from_secs(config.job_store.request_timeout_secs),
        )?;
        let dataset_blobs = open_bucket(config, &config.blob_store.dataset_bucket, &key)?;
        let artifact_blobs = match config.blob_store.artifact_bucket.as_deref() {
            Some(bucket) => Some(open_bucket(config, bucket, &key)?),
            None => None,
        };

        Ok(Self {
            table: Arc::new(table),
            dataset_blobs,
            artifact_blobs,
        })
    }
}

/// Opens `bucket` on the configured blob backend.
pub fn open_bucket(
    config: &WorkerConfig,
    bucket: &str,
    key: &SecretString,
) -> Result<Arc<dyn BlobStore>, BlobError> {
    let blob = &config.blob_store;
    match blob.backend {
        BlobBackend::StorageApi => {
            let url = blob.url.as_deref().unwrap_or(&config.job_store.url);
            let store = StorageApiBlobStore::new(
                url,
                bucket,
                SecretString::from(key.expose_secret()),
                Duration::from_secs(blob.request_timeout_secs),
                blob.page_size,
            )?;
            Ok(Arc::new(store))
        }
        BlobBackend::Local => {
            let root = blob
                .local_root
                .as_deref()
                .ok_or_else(|| BlobError::InvalidUrl("local_root is not set".to_string()))?;
            Ok(Arc::new(LocalBlobStore::new(root.join(bucket))))
        }
    }
}

/// Rate limit for the "no queued jobs" message.
#[derive(Debug)]
pub struct IdleLog {
    interval: Duration,
    last: Option<Instant>,
}

impl IdleLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True at most once per interval.
    pub fn should_log(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// The next idle poll logs again.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

pub struct WorkerLoop {
    store: Arc<JobStoreClient>,
    claimer: Claimer,
    pipeline: Pipeline,
    progress: Arc<dyn ProgressReporter>,
    reaper: Reaper,
    paths: WorkspacePaths,
    poll_interval: Duration,
    max_consecutive_errors: u32,
    idle_log: IdleLog,
    columns_negotiated: bool,
    shutdown: Arc<AtomicBool>,
}

impl WorkerLoop {
    pub fn from_config(
        config: &WorkerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, WorkerError> {
        let backends = WorkerBackends::from_config(config)?;
        Ok(Self::new(config, backends, shutdown))
    }

    /// Wires the loop from an already validated config.
    pub fn new(config: &WorkerConfig, backends: WorkerBackends, shutdown: Arc<AtomicBool>) -> Self {
        let names = ColumnNames {
            owner: config.job_store.owner_column.clone(),
            artifact_reference: config.job_store.artifact_column.clone(),
        };
        let store = Arc::new(JobStoreClient::new(
            backends.table,
            names,
            config.job_store.max_drift_retries,
        ));

        let settings = &config.worker;
        let ledger = Arc::new(JobLedger::new(
            store.clone(),
            LedgerSettings {
                max_message_len: settings.max_error_message_len,
                final_write_attempts: settings.final_write_attempts,
                retry_delay: Duration::from_millis(settings.final_write_retry_ms),
            },
        ));

        let mut claimer = Claimer::new(ledger.clone(), config.job_store.claim_batch_size);
        if let Some(window) = settings
            .stale_reclaim_after_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(TimeDelta::try_seconds)
        {
            info!(window_secs = window.num_seconds(), "Stale job reclaim enabled");
            claimer = claimer.with_stale_reclaim(window);
        }

        let pipeline = Pipeline::new(
            Arc::new(PipelineConfig::from_config(config)),
            ledger.clone(),
            backends.dataset_blobs,
            backends.artifact_blobs,
        );

        Self {
            store,
            claimer,
            pipeline,
            progress: Arc::new(StoreProgress::new(ledger)),
            reaper: Reaper::new(),
            paths: settings.paths.clone(),
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            max_consecutive_errors: settings.max_consecutive_poll_errors.max(1),
            idle_log: IdleLog::new(Duration::from_secs(settings.idle_log_interval_secs)),
            columns_negotiated: false,
            shutdown,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Polls until shutdown is requested or the job store stays unreachable
    /// for `max_consecutive_poll_errors` polls in a row.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Worker started"
        );

        let mut consecutive_errors = 0u32;
        while !self.is_shutdown() {
            match self.run_once().await {
                Ok(Some(result)) => {
                    consecutive_errors = 0;
                    debug!(job_id = %result.job_id, success = result.success, "Job finished");
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    if self.idle_log.should_log(Instant::now()) {
                        info!("No queued jobs, waiting");
                    }
                    self.pause().await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        attempt = consecutive_errors,
                        max = self.max_consecutive_errors,
                        "Job store poll failed: {}",
                        e
                    );
                    if consecutive_errors >= self.max_consecutive_errors {
                        return Err(WorkerError::StoreUnreachable {
                            attempts: consecutive_errors,
                            last_error: e.to_string(),
                        });
                    }
                    self.pause().await;
                }
            }
        }

        info!("Shutdown requested, worker stopped");
        Ok(())
    }

    /// One poll: claim at most one job and take it to a terminal state.
    /// `Ok(None)` means there was nothing to claim. The first poll also
    /// negotiates the writable column set.
    pub async fn run_once(&mut self) -> Result<Option<JobResult>, StoreError> {
        if !self.columns_negotiated {
            self.store.negotiate_columns().await;
            self.columns_negotiated = true;
        }
        let Some(job) = self.claimer.next_job().await? else {
            return Ok(None);
        };
        self.idle_log.reset();

        let ctx = JobContext::new(job.record, job.id, &self.paths);
        let (result, ctx) = self.pipeline.run(ctx, self.progress.as_ref()).await;

        match &result.terminal {
            Some(outcome) => {
                self.reaper
                    .reap(&ctx.layout, outcome)
                    .instrument(info_span!("reap", job_id = %ctx.id))
                    .await;
            }
            None => warn!(
                job_id = %ctx.id,
                "End state unknown, leaving job directories in place"
            ),
        }
        Ok(Some(result))
    }

    /// Sleeps one poll interval, waking early on shutdown.
    async fn pause(&self) {
        let deadline = Instant::now() + self.poll_interval;
        while !self.is_shutdown() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(SHUTDOWN_CHECK)).await;
        }
    }
}

/// Roots created up front so permission problems surface at startup.
pub fn ensure_workspace(paths: &WorkspacePaths) -> Result<(), WorkerError> {
    for dir in [&paths.scratch_root, &paths.output_root, &paths.log_root] {
        std::fs::create_dir_all(dir).map_err(|source| WorkerError::Workspace {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}
