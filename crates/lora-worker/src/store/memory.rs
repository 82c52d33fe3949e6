//! In-process job table.
//!
//! Behaves like a single PostgREST table: every update is applied atomically
//! under one lock, unknown columns are rejected when a column set is
//! configured, and writes can be made to fail on demand.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::error::{Result, StoreError};
use super::{CandidateQuery, Expectation, JobTable, Order, Row};
use crate::job::model::parse_timestamp;
use crate::job::{JobId, JobStatus};

#[derive(Default)]
pub struct MemoryJobTable {
    rows: Mutex<Vec<Row>>,
    columns: Option<BTreeSet<String>>,
    /// Remaining injected failures, keyed by the status a write targets.
    failures: Mutex<HashMap<JobStatus, u32>>,
    update_calls: AtomicU64,
    column_lookups: AtomicU64,
}

impl MemoryJobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the table to `columns`; writes naming anything else fail
    /// with [`StoreError::UnknownColumn`].
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Makes the next `times` writes that set `status` to `target` fail.
    pub fn fail_writes_to(&self, target: JobStatus, times: u32) {
        lock(&self.failures).insert(target, times);
    }

    pub fn insert(&self, row: Value) {
        if let Value::Object(map) = row {
            lock(&self.rows).push(map);
        }
    }

    pub fn get(&self, id: &str) -> Option<Row> {
        lock(&self.rows)
            .iter()
            .find(|r| row_id(r).as_deref() == Some(id))
            .cloned()
    }

    pub fn rows(&self) -> Vec<Row> {
        lock(&self.rows).clone()
    }

    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// How many times the writable column set was asked for.
    pub fn column_lookups(&self) -> u64 {
        self.column_lookups.load(Ordering::SeqCst)
    }

    fn check_columns(&self, fields: &Row) -> Result<()> {
        let Some(columns) = &self.columns else {
            return Ok(());
        };
        // Row iterates in key order, so the first unknown column is deterministic.
        if let Some(column) = fields.keys().find(|k| !columns.contains(*k)) {
            return Err(StoreError::UnknownColumn {
                column: column.clone(),
                message: format!("Could not find the '{}' column in the schema cache", column),
            });
        }
        Ok(())
    }

    fn take_failure(&self, fields: &Row) -> bool {
        let Some(target) = fields
            .get("status")
            .and_then(Value::as_str)
            .map(JobStatus::parse_lossy)
        else {
            return false;
        };
        let mut failures = lock(&self.failures);
        match failures.get_mut(&target) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobTable for MemoryJobTable {
    async fn select(&self, query: &CandidateQuery) -> Result<Vec<Row>> {
        let rows = lock(&self.rows);
        let mut matched: Vec<Row> = rows
            .iter()
            .filter(|row| matches_query(row, query))
            .cloned()
            .collect();

        matched.sort_by_key(|row| row.get("created_at").and_then(parse_timestamp));
        if query.order == Order::NewestFirst {
            matched.reverse();
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn update(&self, id: &JobId, expect: &Expectation, fields: &Row) -> Result<u64> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check_columns(fields)?;
        if self.take_failure(fields) {
            return Err(StoreError::Rejected {
                status: 503,
                body: "injected failure".to_string(),
            });
        }

        let mut rows = lock(&self.rows);
        let mut applied = 0;
        for row in rows.iter_mut() {
            if row_id(row).as_deref() != Some(id.stored()) || !matches_expectation(row, expect) {
                continue;
            }
            for (column, value) in fields {
                row.insert(column.clone(), value.clone());
            }
            applied += 1;
        }
        Ok(applied)
    }

    async fn columns(&self) -> Result<Option<BTreeSet<String>>> {
        self.column_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.columns.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn row_id(row: &Row) -> Option<String> {
    match row.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn row_status(row: &Row) -> JobStatus {
    row.get("status")
        .and_then(Value::as_str)
        .map(JobStatus::parse_lossy)
        .unwrap_or(JobStatus::Unknown)
}

fn matches_query(row: &Row, query: &CandidateQuery) -> bool {
    if let Some(id) = &query.id {
        if row_id(row).as_deref() != Some(id.stored()) {
            return false;
        }
    }
    if !query.statuses.is_empty() && !query.statuses.contains(&row_status(row)) {
        return false;
    }
    if let Some(cutoff) = query.updated_before {
        match row.get("updated_at").and_then(parse_timestamp) {
            Some(updated) if updated < cutoff => {}
            _ => return false,
        }
    }
    true
}

fn matches_expectation(row: &Row, expect: &Expectation) -> bool {
    if let Some(status) = expect.status {
        if row_status(row) != status {
            return false;
        }
    }
    if let Some(cutoff) = expect.updated_before {
        match row.get("updated_at").and_then(parse_timestamp) {
            Some(updated) if updated < cutoff => {}
            _ => return false,
        }
    }
    true
}
