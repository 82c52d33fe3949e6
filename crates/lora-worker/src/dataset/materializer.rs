//! Turns a job's uploaded objects into a trainer-ready directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::caption::{caption_path, caption_text};
use super::scaling::{effective_samples, repeat_factor};
use crate::blob::{join_key, BlobStore};
use crate::config::DatasetConfig;
use crate::error::DatasetError;
use crate::job::JobId;
use crate::layout::JobLayout;

/// What the trainer is pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    /// Storage prefix the items came from.
    pub prefix: String,
    /// Parent of the concept directory; passed as `--train_data_dir`.
    pub root: PathBuf,
    pub concept_dir: PathBuf,
    pub image_count: usize,
    pub repeat: u32,
    pub effective_samples: u64,
    pub captions: Vec<PathBuf>,
}

pub struct DatasetMaterializer {
    blobs: Arc<dyn BlobStore>,
    settings: DatasetConfig,
}

impl DatasetMaterializer {
    pub fn new(blobs: Arc<dyn BlobStore>, settings: DatasetConfig) -> Self {
        Self { blobs, settings }
    }

    pub fn prefix_for(&self, id: &JobId) -> String {
        join_key(&self.settings.prefix_root, id.as_str())
    }

    /// Builds the dataset from scratch. Nothing from an earlier attempt is
    /// reused; on failure, whatever was downloaded stays in staging for the
    /// reaper.
    pub async fn materialize(
        &self,
        id: &JobId,
        layout: &JobLayout,
        trigger: &str,
    ) -> Result<DatasetDescriptor, DatasetError> {
        let root = layout.scratch_dir().to_path_buf();
        let staging = layout.staging_dir();
        reset_dir(&root).await?;
        create_dir(&staging).await?;

        let prefix = self.prefix_for(id);
        let mut objects = self
            .blobs
            .list(&prefix)
            .await
            .map_err(DatasetError::Listing)?;
        if objects.is_empty() {
            return Err(DatasetError::EmptySource { prefix });
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));

        let mut images = Vec::new();
        for object in &objects {
            check_object_name(&object.name)?;
            let dest = staging.join(&object.name);
            let bytes = self
                .blobs
                .get(&object.key, &dest)
                .await
                .map_err(|source| DatasetError::Download {
                    key: object.key.clone(),
                    source,
                })?;
            debug!(name = %object.name, bytes, "Downloaded dataset object");
            if self.is_image(&object.name) {
                images.push(object.name.clone());
            }
        }

        let image_count = images.len();
        if image_count < self.settings.min_images || image_count > self.settings.max_images {
            return Err(DatasetError::ImageCount {
                count: image_count,
                min: self.settings.min_images,
                max: self.settings.max_images,
            });
        }

        let repeat = repeat_factor(self.settings.target_samples, image_count, self.settings.rounding);
        let effective = effective_samples(image_count, repeat);
        info!(
            image_count,
            repeat,
            effective_samples = effective,
            "Dataset scaled"
        );

        let concept_dir = layout.concept_dir(repeat, &self.settings.concept);
        create_dir(&concept_dir).await?;

        let caption = caption_text(trigger, self.settings.caption_description.as_deref());
        let mut captions = Vec::with_capacity(image_count);
        for (index, name) in images.iter().enumerate() {
            let target = concept_dir.join(promoted_name(index, name));
            move_file(&staging.join(name), &target).await?;
            let caption_file = caption_path(&target);
            tokio::fs::write(&caption_file, &caption)
                .await
                .map_err(|e| io_error(&caption_file, e))?;
            captions.push(caption_file);
        }

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!("Could not remove staging directory: {}", e);
        }

        let found = self.count_images(&concept_dir).await?;
        if found != image_count {
            return Err(DatasetError::MoveMismatch {
                expected: image_count,
                found,
            });
        }

        Ok(DatasetDescriptor {
            prefix,
            root,
            concept_dir,
            image_count,
            repeat,
            effective_samples: effective,
            captions,
        })
    }

    fn is_image(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.settings
                    .image_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }

    async fn count_images(&self, dir: &Path) -> Result<usize, DatasetError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| io_error(dir, e))?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
            if let Some(name) = entry.file_name().to_str() {
                if self.is_image(name) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

/// `item_<n>.<ext>`: numbered so that `a.jpg` and `a.png` never share a
/// caption file.
fn promoted_name(index: usize, original: &str) -> String {
    match Path::new(original).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("item_{:03}.{}", index + 1, ext),
        None => format!("item_{:03}", index + 1),
    }
}

/// Object names become file names inside staging; anything that could
/// escape it is refused.
fn check_object_name(name: &str) -> Result<(), DatasetError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.chars().any(char::is_control)
    {
        return Err(DatasetError::UnsafeObjectName {
            name: name.to_string(),
        });
    }
    Ok(())
}

async fn reset_dir(dir: &Path) -> Result<(), DatasetError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(dir, e)),
    }
    create_dir(dir).await
}

async fn create_dir(dir: &Path) -> Result<(), DatasetError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| io_error(dir, e))
}

/// Rename first; copy and delete when the rename crosses filesystems.
async fn move_file(src: &Path, dst: &Path) -> Result<(), DatasetError> {
    if tokio::fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dst)
        .await
        .map_err(|e| io_error(src, e))?;
    tokio::fs::remove_file(src)
        .await
        .map_err(|e| io_error(src, e))
}

fn io_error(path: &Path, source: std::io::Error) -> DatasetError {
    DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}
