use crate::config::{DatasetConfig, TrainingConfig, WorkerConfig};
use crate::layout::WorkspacePaths;

/// The slice of [`WorkerConfig`] a pipeline run reads.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub paths: WorkspacePaths,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    pub artifact_prefix: String,
    pub min_artifact_bytes: u64,
}

impl PipelineConfig {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            paths: config.worker.paths.clone(),
            dataset: config.dataset.clone(),
            training: config.training.clone(),
            artifact_prefix: config.blob_store.artifact_prefix.clone(),
            min_artifact_bytes: config.artifact.min_bytes,
        }
    }
}
