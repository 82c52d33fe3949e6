use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::job::{JobId, JobLedger};
use crate::store::JobPatch;

/// Advisory milestones emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    DatasetReady { image_count: usize, repeat: u32 },
    TrainingStarted,
    TrainingFinished,
}

impl ProgressEvent {
    pub fn percent(&self) -> u8 {
        match self {
            ProgressEvent::DatasetReady { .. } => 15,
            ProgressEvent::TrainingStarted => 20,
            ProgressEvent::TrainingFinished => 90,
        }
    }
}

/// Receives progress milestones. Implementations must not fail the job.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, id: &JobId, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

#[async_trait]
impl ProgressReporter for NoopProgress {
    async fn report(&self, _id: &JobId, _event: ProgressEvent) {}
}

/// Writes milestones to the job row while it is still `training`.
pub struct StoreProgress {
    ledger: Arc<JobLedger>,
}

impl StoreProgress {
    pub fn new(ledger: Arc<JobLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ProgressReporter for StoreProgress {
    async fn report(&self, id: &JobId, event: ProgressEvent) {
        let mut patch = JobPatch::new().set("progress", event.percent());
        if let ProgressEvent::DatasetReady { image_count, repeat } = event {
            patch = patch.set("image_count", image_count).set("repeat", repeat);
        }

        match self.ledger.annotate(id, patch).await {
            Ok(0) => debug!(job_id = %id, "Progress not written: job is no longer training"),
            Ok(_) => debug!(job_id = %id, progress = event.percent(), "Progress updated"),
            Err(e) => warn!(job_id = %id, "Failed to write progress: {}", e),
        }
    }
}
