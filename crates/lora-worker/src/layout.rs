use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Roots under which per-job directories are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspacePaths {
    pub scratch_root: PathBuf,
    pub output_root: PathBuf,
    pub log_root: PathBuf,
}

impl Default for WorkspacePaths {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("/workspace/train_data"),
            output_root: PathBuf::from("/workspace/output_loras"),
            log_root: PathBuf::from("/workspace/logs"),
        }
    }
}

impl WorkspacePaths {
    /// All three roots under one directory. Used by tests and local runs.
    pub fn under(root: &Path) -> Self {
        Self {
            scratch_root: root.join("train_data"),
            output_root: root.join("output_loras"),
            log_root: root.join("logs"),
        }
    }
}

/// Filesystem layout of one job, derived only from its id.
///
/// ```text
/// <scratch_root>/sf_<id>/_raw/              downloads
/// <scratch_root>/sf_<id>/<repeat>_<concept>/ images + captions
/// <output_root>/sf_<id>/sf_<id>.safetensors  artifact
/// <log_root>/sf_<id>.log                     trainer output
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    output_name: String,
    scratch_dir: PathBuf,
    output_dir: PathBuf,
    log_path: PathBuf,
}

impl JobLayout {
    #[must_use]
    pub fn for_job(paths: &WorkspacePaths, id: &JobId) -> Self {
        let output_name = format!("sf_{}", id);
        Self {
            scratch_dir: paths.scratch_root.join(&output_name),
            output_dir: paths.output_root.join(&output_name),
            log_path: paths.log_root.join(format!("{}.log", output_name)),
            output_name,
        }
    }

    #[must_use]
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.scratch_dir.join("_raw")
    }

    #[must_use]
    pub fn concept_dir(&self, repeat: u32, concept: &str) -> PathBuf {
        self.scratch_dir.join(format!("{}_{}", repeat, concept))
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.safetensors", self.output_name))
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_deterministic() {
        let paths = WorkspacePaths::default();
        let id = JobId::parse("abc123").unwrap();
        let layout = JobLayout::for_job(&paths, &id);

        assert_eq!(layout.output_name(), "sf_abc123");
        assert_eq!(layout.scratch_dir(), Path::new("/workspace/train_data/sf_abc123"));
        assert_eq!(layout.staging_dir(), PathBuf::from("/workspace/train_data/sf_abc123/_raw"));
        assert_eq!(
            layout.concept_dir(120, "concept"),
            PathBuf::from("/workspace/train_data/sf_abc123/120_concept")
        );
        assert_eq!(
            layout.artifact_path(),
            PathBuf::from("/workspace/output_loras/sf_abc123/sf_abc123.safetensors")
        );
        assert_eq!(layout.log_path(), Path::new("/workspace/logs/sf_abc123.log"));
        assert_eq!(layout, JobLayout::for_job(&paths, &id));
    }
}
