//! Object storage for datasets and artifacts.
//!
//! A [`BlobStore`] is bound to one bucket. Keys are `/`-separated paths inside
//! that bucket; listing is one level deep, like the storage APIs it models.

use std::path::Path;

use async_trait::async_trait;

pub mod error;
pub mod local;
pub mod storage_api;

pub use error::BlobError;
pub use local::LocalBlobStore;
pub use storage_api::StorageApiBlobStore;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    /// Full key inside the bucket.
    pub key: String,
    /// Last path segment of the key.
    pub name: String,
    pub size: Option<u64>,
}

impl BlobObject {
    pub fn new(prefix: &str, name: &str, size: Option<u64>) -> Self {
        Self {
            key: join_key(prefix, name),
            name: name.to_string(),
            size,
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Objects directly under `prefix`, following pagination to the end.
    async fn list(&self, prefix: &str) -> error::Result<Vec<BlobObject>>;

    /// Downloads `key` to `dest`, returning the number of bytes written.
    async fn get(&self, key: &str, dest: &Path) -> error::Result<u64>;

    /// Uploads `src` to `key`, overwriting any existing object.
    async fn put(&self, key: &str, src: &Path) -> error::Result<()>;

    /// Human-readable location recorded as the artifact reference.
    fn reference(&self, key: &str) -> String;
}

/// Joins key segments with exactly one `/` between them.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Keys never contain empty, `.` or `..` segments.
pub fn validate_key(key: &str) -> error::Result<()> {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty()
        || trimmed
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\'))
    {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}
