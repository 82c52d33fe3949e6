//! Write payloads and the writable-column catalog.

use std::collections::BTreeSet;

use serde_json::Value;

use super::error::StoreError;
use super::Row;
use crate::job::JobStatus;

/// Names of the columns whose spelling differs between deployments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnNames {
    pub owner: String,
    pub artifact_reference: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            owner: "owner_id".to_string(),
            artifact_reference: "artifact_reference".to_string(),
        }
    }
}

/// A field map destined for a single row, with the subset of fields the
/// write is meaningless without.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    fields: Row,
    required: BTreeSet<String>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(column.to_string(), value.into());
        self
    }

    /// Like [`JobPatch::set`], but the column is never stripped.
    pub fn require(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.required.insert(column.to_string());
        self.set(column, value)
    }

    pub fn status(self, status: JobStatus) -> Self {
        self.require("status", status.as_str())
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn is_required(&self, column: &str) -> bool {
        self.required.contains(column)
    }

    pub fn target_status(&self) -> Option<JobStatus> {
        self.fields
            .get("status")
            .and_then(Value::as_str)
            .map(JobStatus::parse_lossy)
    }
}

/// What the client currently believes about the table's writable columns.
///
/// `known` comes from an up-front probe (absent when probing is impossible);
/// `rejected` accumulates columns the store refused at write time, so every
/// later payload is projected without another round trip.
#[derive(Debug, Clone, Default)]
pub struct ColumnCatalog {
    known: Option<BTreeSet<String>>,
    rejected: BTreeSet<String>,
}

impl ColumnCatalog {
    pub fn unprobed() -> Self {
        Self::default()
    }

    pub fn with_known<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: Some(columns.into_iter().map(Into::into).collect()),
            rejected: BTreeSet::new(),
        }
    }

    pub fn set_known(&mut self, columns: BTreeSet<String>) {
        self.known = Some(columns);
    }

    pub fn accepts(&self, column: &str) -> bool {
        if self.rejected.contains(column) {
            return false;
        }
        self.known.as_ref().map_or(true, |k| k.contains(column))
    }

    pub fn reject(&mut self, column: &str) {
        self.rejected.insert(column.to_string());
        if let Some(known) = self.known.as_mut() {
            known.remove(column);
        }
    }

    /// Returns the writable part of `patch` plus the names that were dropped.
    pub fn project(&self, patch: &JobPatch) -> Result<(Row, Vec<String>), StoreError> {
        let mut payload = Row::new();
        let mut dropped = Vec::new();

        for (column, value) in patch.fields() {
            if self.accepts(column) {
                payload.insert(column.clone(), value.clone());
            } else if patch.is_required(column) {
                return Err(StoreError::RequiredColumnRejected {
                    column: column.clone(),
                });
            } else {
                dropped.push(column.clone());
            }
        }

        if payload.is_empty() {
            return Err(StoreError::EmptyPayload);
        }

        Ok((payload, dropped))
    }
}
