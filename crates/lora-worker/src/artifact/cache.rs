//! Local cache of published artifacts for consumers on the same host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::blob::BlobStore;
use crate::error::ArtifactError;

pub struct ArtifactCache {
    blobs: Arc<dyn BlobStore>,
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(blobs: Arc<dyn BlobStore>, dir: impl Into<PathBuf>) -> Self {
        Self {
            blobs,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns a local path holding `key`, downloading it at most once.
    ///
    /// Any non-empty file already at `<dir>/<filename>` is reused as is.
    /// Downloads go to a temporary file in the cache directory and are only
    /// renamed into place after the size checks pass, so a reader never sees
    /// a partial file under the final name.
    pub async fn ensure_cached(
        &self,
        key: &str,
        filename: &str,
        expected_size: Option<u64>,
    ) -> Result<PathBuf, ArtifactError> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename == "."
            || filename == ".."
        {
            return Err(ArtifactError::InvalidName(filename.to_string()));
        }

        let final_path = self.dir.join(filename);
        if let Ok(meta) = tokio::fs::metadata(&final_path).await {
            if meta.is_file() && meta.len() > 0 {
                debug!(file = %filename, "Artifact already cached");
                return Ok(final_path);
            }
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.io_error(&self.dir, e))?;

        let tmp = tempfile::Builder::new()
            .prefix(&format!(".tmp_{}_", filename))
            .tempfile_in(&self.dir)
            .map_err(|e| self.io_error(&self.dir, e))?;

        let written = self
            .blobs
            .get(key, tmp.path())
            .await
            .map_err(|source| ArtifactError::Fetch {
                key: key.to_string(),
                source,
            })?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| self.io_error(tmp.path(), e))?;

        if written == 0 {
            return Err(ArtifactError::Empty(filename.to_string()));
        }
        if let Some(expected) = expected_size {
            if written != expected {
                return Err(ArtifactError::SizeMismatch {
                    name: filename.to_string(),
                    expected,
                    actual: written,
                });
            }
        }

        // The temp file is removed on drop if any step above fails.
        tmp.persist(&final_path)
            .map_err(|e| self.io_error(&final_path, e.error))?;
        info!(file = %filename, size = written, "Artifact cached");
        Ok(final_path)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> ArtifactError {
        ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
