//! Builders for test configuration.

#![allow(dead_code)]

use std::path::PathBuf;

use lora_worker::config::{BlobBackend, WorkerConfig};
use lora_worker::layout::WorkspacePaths;

/// Builds a `WorkerConfig` suited to in-process tests: local blob backend,
/// `/bin/sh` as the trainer program, no retry delays.
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn new() -> Self {
        let mut config = WorkerConfig::default();
        config.job_store.url = "http://localhost:54321".to_string();
        config.job_store.service_key = Some("test-service-key".to_string());
        config.blob_store.backend = BlobBackend::Local;
        config.training.program = "/bin/sh".to_string();
        config.training.pretrained_model = "/models/base.safetensors".to_string();
        config.worker.poll_interval_secs = 0;
        config.worker.final_write_retry_ms = 0;
        Self { config }
    }

    pub fn paths(mut self, paths: WorkspacePaths) -> Self {
        self.config.artifact.cache_dir = paths.scratch_root.join("cache");
        self.config.worker.paths = paths;
        self
    }

    pub fn trainer(mut self, script: PathBuf) -> Self {
        self.config.training.script = Some(script);
        self
    }

    pub fn min_artifact_bytes(mut self, bytes: u64) -> Self {
        self.config.artifact.min_bytes = bytes;
        self
    }

    pub fn image_bounds(mut self, min: usize, max: usize) -> Self {
        self.config.dataset.min_images = min;
        self.config.dataset.max_images = max;
        self
    }

    pub fn final_write_attempts(mut self, attempts: u32) -> Self {
        self.config.worker.final_write_attempts = attempts;
        self
    }

    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

impl Default for WorkerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
