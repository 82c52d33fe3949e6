//! Typed job store client with schema-drift tolerance.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::columns::{ColumnCatalog, ColumnNames, JobPatch};
use super::error::{Result, StoreError};
use super::{CandidateQuery, Expectation, JobTable};
use crate::job::{JobId, JobRecord};

pub struct JobStoreClient {
    table: Arc<dyn JobTable>,
    catalog: Mutex<ColumnCatalog>,
    names: ColumnNames,
    max_drift_retries: usize,
}

impl JobStoreClient {
    pub fn new(table: Arc<dyn JobTable>, names: ColumnNames, max_drift_retries: usize) -> Self {
        Self {
            table,
            catalog: Mutex::new(ColumnCatalog::unprobed()),
            names,
            max_drift_retries,
        }
    }

    pub fn names(&self) -> &ColumnNames {
        &self.names
    }

    /// Probes the writable column set once. A failed or inconclusive probe
    /// leaves the catalog unprobed; writes then rely on strip-and-retry.
    pub async fn negotiate_columns(&self) {
        match self.table.columns().await {
            Ok(Some(columns)) => {
                info!("Job store exposes {} writable columns", columns.len());
                self.with_catalog(|c| c.set_known(columns));
            }
            Ok(None) => debug!("Job store did not report its columns"),
            Err(e) => warn!("Column probe failed, falling back to per-write stripping: {}", e),
        }
    }

    pub async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<Vec<JobRecord>> {
        let rows = self.table.select(query).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match JobRecord::from_row(row, &self.names) {
                Some(record) => records.push(record),
                None => warn!("Skipping job row without usable id/status"),
            }
        }
        Ok(records)
    }

    pub async fn fetch_by_id(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let mut records = self.fetch_candidates(&CandidateQuery::by_id(id)).await?;
        Ok(records.pop())
    }

    /// Writes `patch` to `id` only if `expect` still holds, in one request.
    ///
    /// Columns the store reports as unknown are stripped and the same logical
    /// write is retried, at most `max_drift_retries` times.
    pub async fn conditional_patch(
        &self,
        id: &JobId,
        expect: &Expectation,
        patch: &JobPatch,
    ) -> Result<u64> {
        for attempt in 0..=self.max_drift_retries {
            let (payload, dropped) = self.with_catalog(|c| c.project(patch))?;
            if !dropped.is_empty() {
                debug!(job_id = %id, ?dropped, "Dropped columns the job store does not accept");
            }

            match self.table.update(id, expect, &payload).await {
                Ok(rows) => return Ok(rows),
                Err(StoreError::UnknownColumn { column, message }) => {
                    if patch.is_required(&column) {
                        return Err(StoreError::RequiredColumnRejected { column });
                    }
                    if !payload.contains_key(&column) {
                        // Stripping cannot make progress on this write.
                        return Err(StoreError::UnknownColumn { column, message });
                    }
                    warn!(
                        job_id = %id,
                        attempt = attempt + 1,
                        "Job store rejected column '{}', retrying without it",
                        column
                    );
                    self.with_catalog(|c| c.reject(&column));
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::DriftRetriesExhausted {
            attempts: self.max_drift_retries + 1,
        })
    }

    fn with_catalog<T>(&self, f: impl FnOnce(&mut ColumnCatalog) -> T) -> T {
        let mut guard = match self.catalog.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
