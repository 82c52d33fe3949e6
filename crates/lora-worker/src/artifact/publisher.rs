//! The artifact gate: nothing is reported complete without passing it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::blob::{join_key, BlobStore};
use crate::error::ArtifactError;
use crate::job::JobId;
use crate::layout::JobLayout;
use crate::sanitize::redact_path;

/// Where a validated artifact can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactReference {
    /// Not uploaded; the worker's own file is the artifact.
    Local(PathBuf),
    /// Uploaded to the blob store under `key`.
    Published { key: String, location: String },
}

impl ArtifactReference {
    /// Value written to the job's artifact column.
    pub fn store_value(&self) -> String {
        match self {
            ArtifactReference::Local(path) => path.display().to_string(),
            ArtifactReference::Published { location, .. } => location.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ArtifactReference::Local(_))
    }
}

pub struct ArtifactPublisher {
    blobs: Option<Arc<dyn BlobStore>>,
    prefix: String,
    min_bytes: u64,
}

impl ArtifactPublisher {
    /// With `blobs` unset, artifacts are validated but stay on local disk.
    pub fn new(blobs: Option<Arc<dyn BlobStore>>, prefix: &str, min_bytes: u64) -> Self {
        Self {
            blobs,
            prefix: prefix.to_string(),
            min_bytes,
        }
    }

    pub fn min_bytes(&self) -> u64 {
        self.min_bytes
    }

    /// `exists && size >= min_bytes`. Returns the size.
    pub async fn validate(&self, path: &Path) -> Result<u64, ArtifactError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(ArtifactError::Missing(path.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::Missing(path.to_path_buf()))
            }
            Err(e) => {
                return Err(ArtifactError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let size = metadata.len();
        if size < self.min_bytes {
            return Err(ArtifactError::Undersized {
                path: path.to_path_buf(),
                size,
                min: self.min_bytes,
            });
        }
        Ok(size)
    }

    /// `<prefix>/<job_id>/<output_name>.safetensors`
    pub fn key_for(&self, id: &JobId, layout: &JobLayout) -> String {
        join_key(
            &join_key(&self.prefix, id.as_str()),
            &format!("{}.safetensors", layout.output_name()),
        )
    }

    /// Validates the job's artifact and uploads it when a store is configured.
    /// Re-running with the same file overwrites the same key.
    pub async fn publish(
        &self,
        id: &JobId,
        layout: &JobLayout,
    ) -> Result<ArtifactReference, ArtifactError> {
        let path = layout.artifact_path();
        let size = self.validate(&path).await?;

        let Some(blobs) = &self.blobs else {
            info!(file = %redact_path(&path), size, "Artifact validated, kept on local disk");
            return Ok(ArtifactReference::Local(path));
        };

        let key = self.key_for(id, layout);
        blobs
            .put(&key, &path)
            .await
            .map_err(|source| ArtifactError::Publish {
                key: key.clone(),
                source,
            })?;
        let location = blobs.reference(&key);
        info!(key = %key, size, "Artifact published");
        Ok(ArtifactReference::Published { key, location })
    }
}
