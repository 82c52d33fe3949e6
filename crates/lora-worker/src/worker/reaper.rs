//! Removes a job's local directories once its end state is known.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::artifact::ArtifactReference;
use crate::job::CompletionOutcome;
use crate::layout::JobLayout;
use crate::sanitize::redact_path;

/// Proof that a job reached an end state. The reaper accepts nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// The artifact exists and the completion write landed, was already in
    /// place, or kept failing after the artifact was confirmed.
    Completed { reference: ArtifactReference },
    /// `failed` was written.
    Failed { message: String },
}

impl TerminalOutcome {
    /// `None` when the job moved on to a non-terminal state behind our back,
    /// for example after another worker reclaimed it.
    pub fn from_completion(
        reference: &ArtifactReference,
        completion: &CompletionOutcome,
    ) -> Option<Self> {
        let terminal = match completion {
            CompletionOutcome::Recorded
            | CompletionOutcome::AlreadyRecorded
            | CompletionOutcome::Unconfirmed { .. } => true,
            CompletionOutcome::NotRecorded { current } => {
                current.is_some_and(|status| status.is_terminal())
            }
        };
        terminal.then(|| TerminalOutcome::Completed {
            reference: reference.clone(),
        })
    }

    fn keeps_output(&self) -> bool {
        matches!(self, TerminalOutcome::Completed { reference } if reference.is_local())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reaper;

impl Reaper {
    pub fn new() -> Self {
        Self
    }

    /// Deletes the scratch directory and, unless the artifact reference is
    /// the local file itself, the output directory. The log file is kept.
    ///
    /// Failures are logged and otherwise ignored. Returns what was removed.
    pub async fn reap(&self, layout: &JobLayout, outcome: &TerminalOutcome) -> Vec<PathBuf> {
        let mut targets = vec![layout.scratch_dir()];
        if outcome.keeps_output() {
            debug!("Keeping output directory: artifact is referenced locally");
        } else {
            targets.push(layout.output_dir());
        }

        let mut removed = Vec::new();
        for dir in targets {
            if remove_tree(dir).await {
                removed.push(dir.to_path_buf());
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Reaped job directories");
        }
        removed
    }
}

async fn remove_tree(dir: &Path) -> bool {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(dir = %redact_path(dir), "Failed to remove job directory: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobStatus};
    use crate::layout::WorkspacePaths;

    fn populated_layout(root: &Path) -> JobLayout {
        let layout = JobLayout::for_job(&WorkspacePaths::under(root), &JobId::parse("j1").unwrap());
        std::fs::create_dir_all(layout.staging_dir()).unwrap();
        std::fs::write(layout.staging_dir().join("partial.png"), b"x").unwrap();
        std::fs::create_dir_all(layout.output_dir()).unwrap();
        std::fs::write(layout.artifact_path(), b"weights").unwrap();
        std::fs::create_dir_all(layout.log_path().parent().unwrap()).unwrap();
        std::fs::write(layout.log_path(), b"log").unwrap();
        layout
    }

    #[tokio::test]
    async fn test_failed_job_removes_scratch_and_output_but_keeps_log() {
        let dir = tempfile::tempdir().unwrap();
        let layout = populated_layout(dir.path());

        let removed = Reaper::new()
            .reap(&layout, &TerminalOutcome::Failed { message: "x".into() })
            .await;

        assert_eq!(removed.len(), 2);
        assert!(!layout.scratch_dir().exists());
        assert!(!layout.output_dir().exists());
        assert!(layout.log_path().exists());
    }

    #[tokio::test]
    async fn test_local_reference_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let layout = populated_layout(dir.path());
        let outcome = TerminalOutcome::Completed {
            reference: ArtifactReference::Local(layout.artifact_path()),
        };

        Reaper::new().reap(&layout, &outcome).await;

        assert!(!layout.scratch_dir().exists());
        assert!(layout.artifact_path().exists());
    }

    #[tokio::test]
    async fn test_published_reference_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let layout = populated_layout(dir.path());
        let outcome = TerminalOutcome::Completed {
            reference: ArtifactReference::Published {
                key: "k".into(),
                location: "b/k".into(),
            },
        };

        Reaper::new().reap(&layout, &outcome).await;
        assert!(!layout.output_dir().exists());
    }

    #[tokio::test]
    async fn test_reaping_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let layout = populated_layout(dir.path());
        let outcome = TerminalOutcome::Failed { message: "x".into() };
        Reaper::new().reap(&layout, &outcome).await;
        assert!(Reaper::new().reap(&layout, &outcome).await.is_empty());
    }

    #[test]
    fn test_completion_outcomes_that_are_terminal() {
        let reference = ArtifactReference::Local(PathBuf::from("/o/a.safetensors"));
        assert!(TerminalOutcome::from_completion(&reference, &CompletionOutcome::Recorded).is_some());
        assert!(TerminalOutcome::from_completion(
            &reference,
            &CompletionOutcome::Unconfirmed { last_error: "down".into() }
        )
        .is_some());
        assert!(TerminalOutcome::from_completion(
            &reference,
            &CompletionOutcome::NotRecorded { current: Some(JobStatus::Failed) }
        )
        .is_some());
        assert!(TerminalOutcome::from_completion(
            &reference,
            &CompletionOutcome::NotRecorded { current: Some(JobStatus::Training) }
        )
        .is_none());
        assert!(TerminalOutcome::from_completion(
            &reference,
            &CompletionOutcome::NotRecorded { current: None }
        )
        .is_none());
    }
}
