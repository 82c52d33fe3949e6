//! Directory-backed blob store.
//!
//! Used when artifacts stay on the worker's disk and as the storage backend
//! in pipeline tests. A key maps to `<root>/<key>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::error::{BlobError, Result};
use super::{validate_key, BlobObject, BlobStore};

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key.trim_matches('/')))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>> {
        let prefix = prefix.trim_matches('/');
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.path_for(prefix)?
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BlobError::io(&dir, e)),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BlobError::io(&dir, e))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| BlobError::io(&entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                objects.push(BlobObject::new(prefix, name, Some(metadata.len())));
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<u64> {
        let src = self.path_for(key)?;
        match tokio::fs::copy(&src, dest).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(BlobError::io(&src, e)),
        }
    }

    async fn put(&self, key: &str, src: &Path) -> Result<()> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::io(parent, e))?;
        }

        // Copy next to the destination, then rename over it.
        let partial = dest.with_extension("partial");
        tokio::fs::copy(src, &partial)
            .await
            .map_err(|e| BlobError::io(src, e))?;
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| BlobError::io(&dest, e))?;
        Ok(())
    }

    fn reference(&self, key: &str) -> String {
        self.root.join(key.trim_matches('/')).display().to_string()
    }
}
