use std::sync::Arc;

use tracing::{error, info, info_span, warn, Instrument};

use crate::artifact::{ArtifactPublisher, ArtifactReference};
use crate::blob::BlobStore;
use crate::dataset::{DatasetDescriptor, DatasetMaterializer};
use crate::error::TrainingError;
use crate::job::{CompletionOutcome, JobLedger};
use crate::sanitize;
use crate::training::{build_command, FailureSniffer, MarkerSniffer, TrainingInvoker};
use crate::worker::job::JobResult;

use super::config::PipelineConfig;
use super::context::JobContext;
use super::error::JobError;
use super::progress::{ProgressEvent, ProgressReporter};

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    ledger: Arc<JobLedger>,
    materializer: DatasetMaterializer,
    invoker: TrainingInvoker,
    publisher: ArtifactPublisher,
}

impl Pipeline {
    /// Production constructor. Failure markers come from the training config.
    pub fn new(
        config: Arc<PipelineConfig>,
        ledger: Arc<JobLedger>,
        dataset_blobs: Arc<dyn BlobStore>,
        artifact_blobs: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        let sniffer = Arc::new(MarkerSniffer::new(
            config.training.failure_markers.iter().cloned(),
        ));
        Self::with_sniffer(config, ledger, dataset_blobs, artifact_blobs, sniffer)
    }

    pub fn with_sniffer(
        config: Arc<PipelineConfig>,
        ledger: Arc<JobLedger>,
        dataset_blobs: Arc<dyn BlobStore>,
        artifact_blobs: Option<Arc<dyn BlobStore>>,
        sniffer: Arc<dyn FailureSniffer>,
    ) -> Self {
        let materializer = DatasetMaterializer::new(dataset_blobs, config.dataset.clone());
        let publisher = ArtifactPublisher::new(
            artifact_blobs,
            &config.artifact_prefix,
            config.min_artifact_bytes,
        );
        Self {
            config,
            ledger,
            materializer,
            invoker: TrainingInvoker::new(sniffer),
            publisher,
        }
    }

    /// Run every step for one claimed job and write its terminal status.
    ///
    /// Any error before the artifact is validated marks the job `failed`.
    /// After that point the job is only ever moved to `completed`.
    pub async fn run(
        &self,
        ctx: JobContext,
        progress: &dyn ProgressReporter,
    ) -> (JobResult, JobContext) {
        let span = info_span!("job",
            job_id = %ctx.id,
            owner = ctx.record.owner_id.as_deref().unwrap_or("unknown"),
        );
        self.run_steps(ctx, progress).instrument(span).await
    }

    async fn run_steps(
        &self,
        mut ctx: JobContext,
        progress: &dyn ProgressReporter,
    ) -> (JobResult, JobContext) {
        // Step 1: Materialize the dataset
        let dataset = match self
            .step_materialize(&ctx)
            .instrument(info_span!("materialize_dataset"))
            .await
        {
            Ok(dataset) => dataset,
            Err(e) => return self.fail(ctx, e).await,
        };
        progress
            .report(
                &ctx.id,
                ProgressEvent::DatasetReady {
                    image_count: dataset.image_count,
                    repeat: dataset.repeat,
                },
            )
            .await;
        ctx.dataset = Some(dataset.clone());

        // Step 2: Train
        if let Err(e) = self
            .step_train(&mut ctx, &dataset, progress)
            .instrument(info_span!("train"))
            .await
        {
            return self.fail(ctx, e).await;
        }
        progress.report(&ctx.id, ProgressEvent::TrainingFinished).await;

        // Step 3: Validate and publish the artifact
        let reference = match self
            .publisher
            .publish(&ctx.id, &ctx.layout)
            .instrument(info_span!("publish_artifact"))
            .await
        {
            Ok(reference) => reference,
            Err(e) => return self.fail(ctx, e.into()).await,
        };
        ctx.reference = Some(reference.clone());

        // Step 4: Record completion. Never falls back to `failed`.
        let completion = self
            .step_complete(&ctx, &reference)
            .instrument(info_span!("record_completion"))
            .await;

        let result = JobResult::success(ctx.id.clone(), reference, completion);
        (result, ctx)
    }

    async fn step_materialize(&self, ctx: &JobContext) -> Result<DatasetDescriptor, JobError> {
        let dataset = self
            .materializer
            .materialize(&ctx.id, &ctx.layout, &ctx.trigger)
            .await?;
        info!(
            image_count = dataset.image_count,
            repeat = dataset.repeat,
            effective_samples = dataset.effective_samples,
            "Dataset ready"
        );
        Ok(dataset)
    }

    async fn step_train(
        &self,
        ctx: &mut JobContext,
        dataset: &DatasetDescriptor,
        progress: &dyn ProgressReporter,
    ) -> Result<(), JobError> {
        // A leftover artifact from an earlier attempt must not pass validation.
        let output_dir = ctx.layout.output_dir();
        match tokio::fs::remove_dir_all(output_dir).await {
            Ok(()) => warn!("Removed output from an earlier attempt"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(output_io(output_dir, e)),
        }
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| output_io(output_dir, e))?;

        let command = build_command(&self.config.training, dataset, &ctx.layout);
        ctx.command = Some(command.clone());

        progress.report(&ctx.id, ProgressEvent::TrainingStarted).await;
        let report = self.invoker.run(&command, ctx.layout.log_path()).await?;
        info!(
            lines = report.lines,
            log = %sanitize::redact_path(ctx.layout.log_path()),
            "Training finished"
        );
        ctx.report = Some(report);
        Ok(())
    }

    async fn step_complete(
        &self,
        ctx: &JobContext,
        reference: &ArtifactReference,
    ) -> CompletionOutcome {
        let completion = match self.ledger.complete(&ctx.id, &reference.store_value()).await {
            Ok(completion) => completion,
            Err(e) => CompletionOutcome::Unconfirmed {
                last_error: JobError::from(e).to_string(),
            },
        };

        match &completion {
            CompletionOutcome::Recorded => info!("Job completed"),
            CompletionOutcome::AlreadyRecorded => {
                info!("Job was already completed with this artifact")
            }
            CompletionOutcome::NotRecorded { current } => warn!(
                current = current.map(|s| s.as_str()).unwrap_or("missing"),
                "Artifact published but the job is no longer training"
            ),
            CompletionOutcome::Unconfirmed { last_error } => error!(
                "Artifact published, completion unconfirmed: {}",
                last_error
            ),
        }
        completion
    }

    async fn fail(&self, ctx: JobContext, error: JobError) -> (JobResult, JobContext) {
        let message = error.to_string();
        error!("Job failed: {}", message);

        let recorded = match self.ledger.fail(&ctx.id, &message).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Failure not recorded: job is no longer training");
                false
            }
            Err(e) => {
                error!("Failed to mark job failed in the job store: {}", e);
                false
            }
        };

        (JobResult::failure(ctx.id.clone(), message, recorded), ctx)
    }
}

fn output_io(path: &std::path::Path, source: std::io::Error) -> JobError {
    JobError::TrainingProcess(TrainingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::config::{DatasetConfig, TrainingConfig};
    use crate::job::{JobId, JobRecord, JobStatus, LedgerSettings};
    use crate::layout::WorkspacePaths;
    use crate::pipeline::progress::NoopProgress;
    use crate::store::{ColumnNames, JobStoreClient, MemoryJobTable};
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Writes `bytes` zero bytes as the artifact unless `bytes` is 0.
    fn write_trainer(dir: &Path, bytes: usize) -> PathBuf {
        let script = dir.join("trainer.sh");
        let body = format!(
            r#"out=""; name=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output_dir) out="$2"; shift 2 ;;
    --output_name) name="$2"; shift 2 ;;
    *) shift ;;
  esac
done
touch "{marker}"
echo "training $name"
if [ {bytes} -gt 0 ]; then head -c {bytes} /dev/zero > "$out/$name.safetensors"; fi
"#,
            marker = dir.join("trainer_ran").display(),
            bytes = bytes
        );
        std::fs::write(&script, body).unwrap();
        script
    }

    struct Fixture {
        dir: TempDir,
        table: Arc<MemoryJobTable>,
        pipeline: Pipeline,
        paths: WorkspacePaths,
    }

    fn fixture(artifact_bytes: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = WorkspacePaths::under(dir.path());
        let script = write_trainer(dir.path(), artifact_bytes);

        let config = Arc::new(PipelineConfig {
            paths: paths.clone(),
            dataset: DatasetConfig::default(),
            training: TrainingConfig {
                program: "/bin/sh".into(),
                script: Some(script),
                pretrained_model: "/models/base.safetensors".into(),
                ..TrainingConfig::default()
            },
            artifact_prefix: "loras".into(),
            min_artifact_bytes: 1024,
        });

        let table = Arc::new(MemoryJobTable::new());
        let client = JobStoreClient::new(table.clone(), ColumnNames::default(), 3);
        let ledger = Arc::new(JobLedger::new(Arc::new(client), LedgerSettings::default()));
        let blobs = Arc::new(LocalBlobStore::new(dir.path().join("bucket")));
        let pipeline = Pipeline::new(config, ledger, blobs, None);

        Fixture {
            dir,
            table,
            pipeline,
            paths,
        }
    }

    fn upload_images(fx: &Fixture, job: &str, count: usize) {
        let dir = fx.dir.path().join("bucket").join("lora_datasets").join(job);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            std::fs::write(dir.join(format!("{:02}.png", i)), b"png").unwrap();
        }
    }

    fn training_context(fx: &Fixture, job: &str) -> JobContext {
        fx.table.insert(json!({
            "id": job,
            "owner_id": "u1",
            "status": "training",
            "progress": 1,
            "created_at": "2026-01-01T00:00:00Z"
        }));
        let record = JobRecord {
            id: job.into(),
            owner_id: Some("u1".into()),
            status: JobStatus::Training,
            progress: Some(1),
            error_message: None,
            image_count: None,
            artifact_reference: None,
            trigger_token: None,
            created_at: None,
            updated_at: None,
        };
        let id = JobId::parse(job).unwrap();
        JobContext::new(record, id, &fx.paths)
    }

    #[tokio::test]
    async fn test_full_pipeline_records_local_artifact() {
        let fx = fixture(4096);
        upload_images(&fx, "j1", 12);

        let (result, ctx) = fx.pipeline.run(training_context(&fx, "j1"), &NoopProgress).await;

        assert!(result.success, "pipeline failed: {:?}", result.error);
        assert_eq!(result.completion, Some(CompletionOutcome::Recorded));
        assert_eq!(ctx.dataset.as_ref().map(|d| d.repeat), Some(100));
        assert!(ctx.command.is_some());

        let row = fx.table.get("j1").unwrap();
        assert_eq!(row["status"], json!("completed"));
        assert_eq!(row["progress"], json!(100));
        assert_eq!(
            row["artifact_reference"],
            json!(ctx.layout.artifact_path().display().to_string())
        );
    }

    #[tokio::test]
    async fn test_bad_image_count_fails_before_training() {
        let fx = fixture(4096);
        upload_images(&fx, "j1", 7);

        let (result, _ctx) = fx.pipeline.run(training_context(&fx, "j1"), &NoopProgress).await;

        assert!(!result.success);
        assert!(result.terminal.is_some());
        assert!(!fx.dir.path().join("trainer_ran").exists());

        let row = fx.table.get("j1").unwrap();
        assert_eq!(row["status"], json!("failed"));
        assert_eq!(row["progress"], json!(0));
        assert!(row["error_message"].as_str().unwrap().contains('7'));
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_job() {
        let fx = fixture(0);
        upload_images(&fx, "j1", 10);

        let (result, _ctx) = fx.pipeline.run(training_context(&fx, "j1"), &NoopProgress).await;

        assert!(fx.dir.path().join("trainer_ran").exists());
        assert!(result.error.unwrap().contains("Training produced no artifact"));
        assert_eq!(fx.table.get("j1").unwrap()["status"], json!("failed"));
    }

    #[tokio::test]
    async fn test_stale_artifact_from_earlier_attempt_is_discarded() {
        let fx = fixture(0);
        upload_images(&fx, "j1", 10);
        let ctx = training_context(&fx, "j1");
        std::fs::create_dir_all(ctx.layout.output_dir()).unwrap();
        std::fs::write(ctx.layout.artifact_path(), vec![0u8; 8192]).unwrap();

        let (result, _ctx) = fx.pipeline.run(ctx, &NoopProgress).await;

        assert!(!result.success);
        assert_eq!(fx.table.get("j1").unwrap()["status"], json!("failed"));
    }
}
