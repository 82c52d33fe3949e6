//! Job identity, status, and the lifecycle gate every status write goes through.

pub mod lifecycle;
pub mod model;

pub use lifecycle::{is_allowed, is_reclaimable, CompletionOutcome, JobLedger, LedgerSettings};
pub use model::{JobId, JobIdError, JobRecord, JobStatus};
