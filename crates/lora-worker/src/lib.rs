pub mod artifact;
pub mod blob;
pub mod config;
pub mod dataset;
pub mod error;
pub mod job;
pub mod layout;
pub mod pipeline;
pub mod sanitize;
pub mod secrets;
pub mod store;
pub mod training;
pub mod worker;

pub use artifact::{ArtifactCache, ArtifactPublisher, ArtifactReference};
pub use blob::{BlobError, BlobStore, LocalBlobStore, StorageApiBlobStore};
pub use config::{load_config, load_effective_config, WorkerConfig};
pub use error::{ArtifactError, ConfigError, DatasetError, Result, TrainingError, WorkerError};
pub use job::{CompletionOutcome, JobId, JobLedger, JobRecord, JobStatus};
pub use layout::{JobLayout, WorkspacePaths};
pub use pipeline::{JobContext, JobError, Pipeline, PipelineConfig};
pub use secrets::{resolve_secret, SecretError};
pub use store::{JobStoreClient, JobTable, MemoryJobTable, PostgrestTable, StoreError};
pub use worker::{JobResult, Reaper, TerminalOutcome, WorkerLoop};
