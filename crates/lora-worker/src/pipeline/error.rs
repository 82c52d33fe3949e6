use thiserror::Error;

/// Everything that can end a job as `failed`.
///
/// The message of each variant is what ends up in the job's `error_message`.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Dataset(#[from] crate::error::DatasetError),

    #[error(transparent)]
    TrainingProcess(#[from] crate::error::TrainingError),

    #[error(transparent)]
    ArtifactValidation(#[from] crate::error::ArtifactError),

    #[error("Job store write failed: {0}")]
    Persistence(#[from] crate::store::StoreError),
}
