use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop the worker process as a whole.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Blob store error: {0}")]
    Blob(#[from] crate::blob::BlobError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Job store unreachable after {attempts} consecutive failed polls: {last_error}")]
    StoreUnreachable { attempts: u32, last_error: String },

    #[error("Failed to install signal handler: {0}")]
    Signal(String),

    #[error("Failed to prepare workspace directory '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid job id: {0}")]
    InvalidJobId(#[from] crate::job::JobIdError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Missing required setting '{name}'")]
    Missing { name: &'static str },

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to resolve secret '{name}': {source}")]
    Secret {
        name: &'static str,
        #[source]
        source: crate::secrets::SecretError,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("No objects found in storage under '{prefix}'")]
    EmptySource { prefix: String },

    #[error("Invalid image count: {count} (expected between {min} and {max})")]
    ImageCount { count: usize, min: usize, max: usize },

    #[error("Refusing unsafe object name '{name}'")]
    UnsafeObjectName { name: String },

    #[error("Dataset move mismatch: expected {expected} images, found {found}")]
    MoveMismatch { expected: usize, found: usize },

    #[error("Failed to download '{key}': {source}")]
    Download {
        key: String,
        #[source]
        source: crate::blob::BlobError,
    },

    #[error("Failed to list dataset objects: {0}")]
    Listing(#[source] crate::blob::BlobError),

    #[error("Filesystem error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Failed to spawn training process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Training process failed (exit={code})")]
    ExitStatus { code: String },

    #[error("Training aborted: output reported '{marker}'")]
    FailureMarker { marker: String },

    #[error("Failed to prepare training output at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Training produced no artifact: missing {0}")]
    Missing(PathBuf),

    #[error("Training artifact too small ({size} bytes, minimum {min}): {path}")]
    Undersized { path: PathBuf, size: u64, min: u64 },

    #[error("Failed to publish artifact '{key}': {source}")]
    Publish {
        key: String,
        #[source]
        source: crate::blob::BlobError,
    },

    #[error("Failed to fetch artifact '{key}': {source}")]
    Fetch {
        key: String,
        #[source]
        source: crate::blob::BlobError,
    },

    #[error("Invalid artifact file name '{0}'")]
    InvalidName(String),

    #[error("Cached artifact size mismatch for '{name}': expected {expected}, got {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Downloaded artifact is empty: {0}")]
    Empty(String),

    #[error("Artifact file error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, WorkerError>;
