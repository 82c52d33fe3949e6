//! Job store error types.

use thiserror::Error;

use crate::job::JobStatus;

/// Errors from job store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("Job store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store does not know a column present in the write payload.
    #[error("Unknown column '{column}': {message}")]
    UnknownColumn { column: String, message: String },

    /// A column the write cannot do without was rejected by the store.
    #[error("Required column '{column}' was rejected by the job store")]
    RequiredColumnRejected { column: String },

    /// Any other non-success response.
    #[error("Job store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Write still rejected after {attempts} schema-drift attempts")]
    DriftRetriesExhausted { attempts: usize },

    #[error("Nothing left to write after projecting payload onto known columns")]
    EmptyPayload,

    #[error("Transition {from} -> {to} is not allowed")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Failed to decode job store response: {0}")]
    Decode(String),

    #[error("Invalid job store URL: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    pub fn is_unknown_column(&self) -> bool {
        matches!(self, StoreError::UnknownColumn { .. })
    }
}

/// Result type for job store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
