use crate::artifact::ArtifactReference;
use crate::job::{CompletionOutcome, JobId};

use super::reaper::TerminalOutcome;

/// What one pipeline run did to a claimed job.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: JobId,
    /// The artifact passed validation.
    pub success: bool,
    pub reference: Option<ArtifactReference>,
    pub completion: Option<CompletionOutcome>,
    pub error: Option<String>,
    /// Set only when the job's end state is known well enough to clean up.
    pub terminal: Option<TerminalOutcome>,
}

impl JobResult {
    pub fn success(
        job_id: JobId,
        reference: ArtifactReference,
        completion: CompletionOutcome,
    ) -> Self {
        let terminal = TerminalOutcome::from_completion(&reference, &completion);
        Self {
            job_id,
            success: true,
            reference: Some(reference),
            completion: Some(completion),
            error: None,
            terminal,
        }
    }

    /// `recorded` is whether the `failed` status reached the store.
    pub fn failure(job_id: JobId, error: String, recorded: bool) -> Self {
        Self {
            job_id,
            success: false,
            reference: None,
            completion: None,
            terminal: recorded.then(|| TerminalOutcome::Failed {
                message: error.clone(),
            }),
            error: Some(error),
        }
    }

    /// Completed in the store, now or by an earlier attempt.
    pub fn is_durably_completed(&self) -> bool {
        self.completion
            .as_ref()
            .is_some_and(CompletionOutcome::is_durable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn id() -> JobId {
        JobId::parse("j1").unwrap()
    }

    #[test]
    fn test_success_result() {
        let reference = ArtifactReference::Published {
            key: "loras/j1/sf_j1.safetensors".into(),
            location: "loras-bucket/loras/j1/sf_j1.safetensors".into(),
        };
        let result = JobResult::success(id(), reference.clone(), CompletionOutcome::Recorded);
        assert!(result.success);
        assert!(result.is_durably_completed());
        assert_eq!(result.reference, Some(reference));
        assert!(result.terminal.is_some());
        assert!(result.error.is_none());
    }

    #[test]
    fn test_unconfirmed_completion_is_still_terminal() {
        let result = JobResult::success(
            id(),
            ArtifactReference::Local(PathBuf::from("/out/sf_j1.safetensors")),
            CompletionOutcome::Unconfirmed {
                last_error: "timeout".into(),
            },
        );
        assert!(result.success);
        assert!(!result.is_durably_completed());
        assert!(result.terminal.is_some());
    }

    #[test]
    fn test_failure_result() {
        let recorded = JobResult::failure(id(), "Invalid image count: 3".into(), true);
        assert!(!recorded.success);
        assert_eq!(recorded.error.as_deref(), Some("Invalid image count: 3"));
        assert!(matches!(recorded.terminal, Some(TerminalOutcome::Failed { .. })));

        let lost = JobResult::failure(id(), "boom".into(), false);
        assert!(lost.terminal.is_none());
    }
}
