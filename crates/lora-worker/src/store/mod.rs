//! Job store access.
//!
//! [`JobTable`] is the raw transport over a single table-like resource
//! (PostgREST in production, an in-memory table in tests). [`JobStoreClient`]
//! sits on top and adds column negotiation plus strip-and-retry for writes
//! carrying columns the store does not know.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{JobId, JobStatus};

pub mod client;
pub mod columns;
pub mod error;
pub mod memory;
pub mod rest;

pub use client::JobStoreClient;
pub use columns::{ColumnCatalog, ColumnNames, JobPatch};
pub use error::StoreError;
pub use memory::MemoryJobTable;
pub use rest::PostgrestTable;

/// One row as returned by the store.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Row ordering for candidate fetches. Always keyed on `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Equality/ordering/limit filter for reads.
#[derive(Debug, Clone, Default)]
pub struct CandidateQuery {
    pub id: Option<JobId>,
    pub statuses: Vec<JobStatus>,
    pub updated_before: Option<DateTime<Utc>>,
    pub order: Order,
    pub limit: Option<usize>,
}

impl CandidateQuery {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn by_id(id: &JobId) -> Self {
        Self {
            id: Some(id.clone()),
            limit: Some(1),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }
}

/// Preconditions a conditional write must still satisfy when it lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expectation {
    pub status: Option<JobStatus>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl Expectation {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            updated_before: None,
        }
    }
}

/// Raw access to the job table.
#[async_trait]
pub trait JobTable: Send + Sync {
    async fn select(&self, query: &CandidateQuery) -> error::Result<Vec<Row>>;

    /// Applies `fields` to the row with `id` if `expect` still holds, as one
    /// request. Returns the number of rows changed.
    async fn update(&self, id: &JobId, expect: &Expectation, fields: &Row) -> error::Result<u64>;

    /// Writable columns, when the backend can tell.
    async fn columns(&self) -> error::Result<Option<BTreeSet<String>>> {
        Ok(None)
    }
}
