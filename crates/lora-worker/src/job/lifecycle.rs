//! Status transition rules and the single writer of job status.
//!
//! Every status write in the worker goes through [`JobLedger`], which checks
//! [`is_allowed`] and then issues one conditional patch keyed on the status
//! the job must still have. A write that affects zero rows means another
//! worker (or an operator) got there first.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::model::{JobId, JobRecord, JobStatus};
use crate::sanitize::truncate_message;
use crate::store::error::{Result, StoreError};
use crate::store::{Expectation, JobPatch, JobStoreClient};

/// The only legal edges: `queued -> training -> {completed, failed}`.
pub fn is_allowed(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::Queued, JobStatus::Training)
            | (JobStatus::Training, JobStatus::Completed)
            | (JobStatus::Training, JobStatus::Failed)
    )
}

/// A `training` job whose last update is older than `window`.
///
/// Rows without `updated_at` are never reclaimable.
pub fn is_reclaimable(record: &JobRecord, now: DateTime<Utc>, window: TimeDelta) -> bool {
    record.status == JobStatus::Training
        && record
            .updated_at
            .is_some_and(|updated| now.signed_duration_since(updated) > window)
}

/// Result of the completion write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// This call moved the job to `completed`.
    Recorded,
    /// The job was already `completed` with the same artifact reference.
    AlreadyRecorded,
    /// The write landed on nothing: the job is no longer `training`.
    NotRecorded { current: Option<JobStatus> },
    /// Every attempt failed at the store. The job may still read `training`.
    Unconfirmed { last_error: String },
}

impl CompletionOutcome {
    /// Whether the store durably holds the completed status.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            CompletionOutcome::Recorded | CompletionOutcome::AlreadyRecorded
        )
    }
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Longest `error_message` written to the store, in characters.
    pub max_message_len: usize,
    /// Full-payload attempts for the completion write.
    pub final_write_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_message_len: 500,
            final_write_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

pub struct JobLedger {
    store: Arc<JobStoreClient>,
    settings: LedgerSettings,
}

impl JobLedger {
    pub fn new(store: Arc<JobStoreClient>, settings: LedgerSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<JobStoreClient> {
        &self.store
    }

    /// `queued -> training`. Returns `false` when another claimant won.
    pub async fn claim(&self, id: &JobId) -> Result<bool> {
        let now = timestamp(Utc::now());
        let patch = self
            .transition(JobStatus::Queued, JobStatus::Training)?
            .set("started_at", now.clone())
            .set("progress", 1)
            .require("error_message", Value::Null)
            .set("updated_at", now);

        let rows = self
            .store
            .conditional_patch(id, &Expectation::status(JobStatus::Queued), &patch)
            .await?;
        if rows == 0 {
            debug!(job_id = %id, "Claim lost: job is no longer queued");
        }
        Ok(rows > 0)
    }

    /// Takes over a `training` job whose last update is older than `cutoff`.
    ///
    /// Not a status transition: the status stays `training` and the write is
    /// gated on both the status and the age of `updated_at`.
    pub async fn reclaim(&self, id: &JobId, cutoff: DateTime<Utc>) -> Result<bool> {
        let now = timestamp(Utc::now());
        let patch = JobPatch::new()
            .set("started_at", now.clone())
            .set("progress", 1)
            .require("error_message", Value::Null)
            .require("updated_at", now);
        let expect = Expectation {
            status: Some(JobStatus::Training),
            updated_before: Some(cutoff),
        };

        let rows = self.store.conditional_patch(id, &expect, &patch).await?;
        if rows > 0 {
            warn!(job_id = %id, cutoff = %cutoff, "Reclaimed stale training job");
        }
        Ok(rows > 0)
    }

    /// Writes bookkeeping fields to a job that must still be `training`.
    /// Never changes status.
    pub async fn annotate(&self, id: &JobId, patch: JobPatch) -> Result<u64> {
        if let Some(to) = patch.target_status() {
            return Err(StoreError::IllegalTransition {
                from: JobStatus::Training,
                to,
            });
        }
        let patch = patch.set("updated_at", timestamp(Utc::now()));
        self.store
            .conditional_patch(id, &Expectation::status(JobStatus::Training), &patch)
            .await
    }

    /// `training -> failed` with a truncated, human-readable message.
    pub async fn fail(&self, id: &JobId, message: &str) -> Result<bool> {
        let message = truncate_message(message, self.settings.max_message_len);
        let patch = self
            .transition(JobStatus::Training, JobStatus::Failed)?
            .require("error_message", message)
            .set("progress", 0)
            .set("updated_at", timestamp(Utc::now()));

        let rows = self
            .store
            .conditional_patch(id, &Expectation::status(JobStatus::Training), &patch)
            .await?;
        Ok(rows > 0)
    }

    /// `training -> completed` with the artifact reference.
    ///
    /// Only called once the artifact has passed validation. Store errors are
    /// retried, then one minimal write (status and reference only) is tried,
    /// and the outcome is reported rather than raised: once an artifact
    /// exists the job must never be marked `failed` over bookkeeping.
    pub async fn complete(&self, id: &JobId, reference: &str) -> Result<CompletionOutcome> {
        let column = self.store.names().artifact_reference.clone();
        let minimal = self
            .transition(JobStatus::Training, JobStatus::Completed)?
            .require(&column, reference);
        let full = minimal
            .clone()
            .set("progress", 100)
            .set("error_message", Value::Null)
            .set("updated_at", timestamp(Utc::now()));

        let attempts = self.settings.final_write_attempts.max(1);
        for attempt in 1..=attempts {
            match self.write_completion(id, &full, reference).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(
                        job_id = %id,
                        attempt,
                        attempts,
                        "Completion write failed: {}",
                        e
                    );
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        match self.write_completion(id, &minimal, reference).await {
            Ok(outcome) => {
                info!(job_id = %id, "Completion recorded with minimal payload");
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    job_id = %id,
                    reference,
                    "Artifact is published but the completed status could not be written: {}",
                    e
                );
                Ok(CompletionOutcome::Unconfirmed {
                    last_error: e.to_string(),
                })
            }
        }
    }

    async fn write_completion(
        &self,
        id: &JobId,
        patch: &JobPatch,
        reference: &str,
    ) -> Result<CompletionOutcome> {
        let rows = self
            .store
            .conditional_patch(id, &Expectation::status(JobStatus::Training), patch)
            .await?;
        if rows > 0 {
            return Ok(CompletionOutcome::Recorded);
        }

        let current = self.store.fetch_by_id(id).await?;
        match current {
            Some(record)
                if record.status == JobStatus::Completed
                    && record.artifact_reference.as_deref() == Some(reference) =>
            {
                Ok(CompletionOutcome::AlreadyRecorded)
            }
            other => Ok(CompletionOutcome::NotRecorded {
                current: other.map(|r| r.status),
            }),
        }
    }

    fn transition(&self, from: JobStatus, to: JobStatus) -> Result<JobPatch> {
        if !is_allowed(from, to) {
            return Err(StoreError::IllegalTransition { from, to });
        }
        Ok(JobPatch::new().status(to))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
