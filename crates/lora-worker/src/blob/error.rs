use std::path::PathBuf;

use thiserror::Error;

/// Errors from blob store operations.
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Blob store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("Invalid blob store URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to decode blob store response: {0}")]
    Decode(String),

    #[error("Local file error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BlobError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        BlobError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BlobError>;
