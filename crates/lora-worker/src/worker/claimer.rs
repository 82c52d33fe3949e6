//! Picks the next job and claims it.
//!
//! Safety comes entirely from the conditional claim write: any number of
//! workers may select the same candidate, and only one will see a row change.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::job::{is_reclaimable, JobId, JobLedger, JobRecord, JobStatus};
use crate::store::error::Result;
use crate::store::CandidateQuery;

/// A job this worker now owns.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    /// The row as read before the claim, with the status updated to `training`.
    pub record: JobRecord,
    pub reclaimed: bool,
}

pub struct Claimer {
    ledger: Arc<JobLedger>,
    batch_size: usize,
    reclaim_after: Option<TimeDelta>,
}

impl Claimer {
    pub fn new(ledger: Arc<JobLedger>, batch_size: usize) -> Self {
        Self {
            ledger,
            batch_size: batch_size.max(1),
            reclaim_after: None,
        }
    }

    /// Enables re-claiming `training` jobs untouched for longer than `window`.
    pub fn with_stale_reclaim(mut self, window: TimeDelta) -> Self {
        self.reclaim_after = Some(window);
        self
    }

    /// Claims the next eligible job, or returns `None` when there is nothing
    /// this worker may take right now. Losing a race is not an error.
    pub async fn next_job(&self) -> Result<Option<ClaimedJob>> {
        if let Some(window) = self.reclaim_after {
            if let Some(job) = self.reclaim_stale(window).await? {
                return Ok(Some(job));
            }
        }

        let store = self.ledger.store();
        let queued = store
            .fetch_candidates(&CandidateQuery::with_status(JobStatus::Queued).limit(self.batch_size))
            .await?;
        if queued.is_empty() {
            return Ok(None);
        }
        let training = store
            .fetch_candidates(&CandidateQuery::with_status(JobStatus::Training))
            .await?;

        for (id, record) in select_eligible(&queued, &training) {
            if self.ledger.claim(&id).await? {
                info!(job_id = %id, "Claimed job");
                return Ok(Some(ClaimedJob {
                    id,
                    record: JobRecord {
                        status: JobStatus::Training,
                        ..record.clone()
                    },
                    reclaimed: false,
                }));
            }
            debug!(job_id = %id, "Another worker claimed the job first");
        }
        Ok(None)
    }

    async fn reclaim_stale(&self, window: TimeDelta) -> Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let cutoff = now - window;
        let stale = self
            .ledger
            .store()
            .fetch_candidates(
                &CandidateQuery::with_status(JobStatus::Training)
                    .updated_before(cutoff)
                    .limit(self.batch_size),
            )
            .await?;

        for record in stale.iter().filter(|r| is_reclaimable(r, now, window)) {
            let Ok(id) = record.job_id() else {
                continue;
            };
            if self.ledger.reclaim(&id, cutoff).await? {
                return Ok(Some(ClaimedJob {
                    id,
                    record: record.clone(),
                    reclaimed: true,
                }));
            }
        }
        Ok(None)
    }
}

/// Queued candidates this worker may try to claim, oldest first.
///
/// An owner with a job in `training` gets nothing, and only the oldest queued
/// job of each owner is considered. Rows whose id cannot be canonicalized are
/// skipped with a warning. Jobs without an owner are never held back.
pub fn select_eligible<'a>(
    queued: &'a [JobRecord],
    training: &[JobRecord],
) -> Vec<(JobId, &'a JobRecord)> {
    let mut busy: HashSet<&str> = training
        .iter()
        .filter(|r| r.status.is_actionable())
        .filter_map(|r| r.owner_id.as_deref())
        .collect();

    let mut eligible = Vec::new();
    for record in queued {
        if record.status != JobStatus::Queued {
            continue;
        }
        if let Some(owner) = record.owner_id.as_deref() {
            if !busy.insert(owner) {
                continue;
            }
        }
        match record.job_id() {
            Ok(id) => eligible.push((id, record)),
            Err(e) => warn!("Skipping job with unusable id {:?}: {}", record.id, e),
        }
    }
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::LedgerSettings;
    use crate::store::{ColumnNames, JobStoreClient, MemoryJobTable};
    use serde_json::json;

    fn record(id: &str, owner: Option<&str>, status: JobStatus) -> JobRecord {
        JobRecord {
            id: id.into(),
            owner_id: owner.map(str::to_string),
            status,
            progress: None,
            error_message: None,
            image_count: None,
            artifact_reference: None,
            trigger_token: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn ids(selected: &[(JobId, &JobRecord)]) -> Vec<String> {
        selected.iter().map(|(id, _)| id.to_string()).collect()
    }

    #[test]
    fn test_busy_owner_is_skipped() {
        let queued = vec![
            record("a", Some("u1"), JobStatus::Queued),
            record("b", Some("u2"), JobStatus::Queued),
        ];
        let training = vec![record("t", Some("u1"), JobStatus::Training)];
        assert_eq!(ids(&select_eligible(&queued, &training)), vec!["b"]);
    }

    #[test]
    fn test_finished_rows_do_not_hold_owner() {
        let queued = vec![record("a", Some("u1"), JobStatus::Queued)];
        // Row moved on between the two reads.
        let training = vec![record("t", Some("u1"), JobStatus::Completed)];
        assert_eq!(ids(&select_eligible(&queued, &training)), vec!["a"]);
    }

    #[test]
    fn test_only_oldest_job_per_owner() {
        let queued = vec![
            record("a", Some("u1"), JobStatus::Queued),
            record("b", Some("u1"), JobStatus::Queued),
            record("c", None, JobStatus::Queued),
            record("d", None, JobStatus::Queued),
        ];
        assert_eq!(ids(&select_eligible(&queued, &[])), vec!["a", "c", "d"]);
    }

    #[test]
    fn test_bad_ids_and_non_queued_rows_are_skipped() {
        let queued = vec![
            record("bad\nid", Some("u1"), JobStatus::Queued),
            record("idle1", Some("u2"), JobStatus::Idle),
            record("ok", Some("u3"), JobStatus::Queued),
        ];
        assert_eq!(ids(&select_eligible(&queued, &[])), vec!["ok"]);
    }

    fn claimer(table: Arc<MemoryJobTable>) -> Claimer {
        let client = JobStoreClient::new(table, ColumnNames::default(), 3);
        let ledger = JobLedger::new(Arc::new(client), LedgerSettings::default());
        Claimer::new(Arc::new(ledger), 10)
    }

    #[tokio::test]
    async fn test_claims_oldest_queued_job() {
        let table = Arc::new(MemoryJobTable::new());
        table.insert(json!({"id": "new", "owner_id": "u1", "status": "queued", "created_at": "2026-02-02T00:00:00Z"}));
        table.insert(json!({"id": "old", "owner_id": "u2", "status": "queued", "created_at": "2026-01-01T00:00:00Z"}));

        let job = claimer(table.clone()).next_job().await.unwrap().unwrap();
        assert_eq!(job.id.as_str(), "old");
        assert_eq!(job.record.status, JobStatus::Training);
        assert!(!job.reclaimed);

        let row = table.get("old").unwrap();
        assert_eq!(row["status"], json!("training"));
        assert_eq!(row["progress"], json!(1));
        assert_eq!(row["error_message"], json!(null));
        assert!(row.contains_key("started_at"));
        assert_eq!(table.get("new").unwrap()["status"], json!("queued"));
    }

    #[tokio::test]
    async fn test_uppercase_uuid_row_is_claimed() {
        let raw = "0F8FAD5B-D9CB-469F-A165-70867728950E";
        let table = Arc::new(MemoryJobTable::new());
        table.insert(json!({"id": raw, "owner_id": "u1", "status": "queued"}));

        let job = claimer(table.clone()).next_job().await.unwrap().unwrap();
        assert_eq!(job.id.as_str(), "0f8fad5b-d9cb-469f-a165-70867728950e");
        assert_eq!(job.id.stored(), raw);
        assert_eq!(table.get(raw).unwrap()["status"], json!("training"));
    }

    #[tokio::test]
    async fn test_legacy_and_terminal_rows_are_never_claimed() {
        let table = Arc::new(MemoryJobTable::new());
        table.insert(json!({"id": "i", "status": "idle"}));
        table.insert(json!({"id": "c", "status": "completed"}));
        table.insert(json!({"id": "f", "status": "failed"}));

        assert!(claimer(table.clone()).next_job().await.unwrap().is_none());
        assert_eq!(table.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_reclaim_is_opt_in() {
        let table = Arc::new(MemoryJobTable::new());
        table.insert(json!({"id": "s", "status": "training", "updated_at": "2020-01-01T00:00:00Z"}));

        assert!(claimer(table.clone()).next_job().await.unwrap().is_none());

        let job = claimer(table.clone())
            .with_stale_reclaim(TimeDelta::hours(6))
            .next_job()
            .await
            .unwrap()
            .unwrap();
        assert!(job.reclaimed);
        assert_eq!(job.id.as_str(), "s");
    }
}
