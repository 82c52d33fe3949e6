use crate::artifact::ArtifactReference;
use crate::dataset::DatasetDescriptor;
use crate::job::{JobId, JobRecord};
use crate::layout::{JobLayout, WorkspacePaths};
use crate::training::{TrainingCommand, TrainingReport};

/// State of one claimed job as it moves through the pipeline.
pub struct JobContext {
    // Input
    pub record: JobRecord,
    pub id: JobId,
    pub layout: JobLayout,
    pub trigger: String,

    // Step 1 result
    pub dataset: Option<DatasetDescriptor>,

    // Step 2 result
    pub command: Option<TrainingCommand>,

    // Step 3 result
    pub report: Option<TrainingReport>,

    // Step 4 result, set only once the artifact passed validation
    pub reference: Option<ArtifactReference>,
}

impl JobContext {
    pub fn new(record: JobRecord, id: JobId, paths: &WorkspacePaths) -> Self {
        let layout = JobLayout::for_job(paths, &id);
        let trigger = record
            .trigger_token
            .clone()
            .unwrap_or_else(|| format!("sf_{}", id.short()));
        Self {
            record,
            id,
            layout,
            trigger,
            dataset: None,
            command: None,
            report: None,
            reference: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    fn record(trigger: Option<&str>) -> JobRecord {
        JobRecord {
            id: "0f8fad5b-d9cb-469f-a165-70867728950e".into(),
            owner_id: Some("u1".into()),
            status: JobStatus::Training,
            progress: Some(1),
            error_message: None,
            image_count: None,
            artifact_reference: None,
            trigger_token: trigger.map(str::to_string),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_trigger_defaults_to_short_id() {
        let rec = record(None);
        let id = rec.job_id().unwrap();
        let ctx = JobContext::new(rec, id, &WorkspacePaths::default());
        assert_eq!(ctx.trigger, "sf_0f8fad5b");
        assert!(ctx.dataset.is_none() && ctx.reference.is_none());
    }

    #[test]
    fn test_trigger_from_record() {
        let rec = record(Some("ohwx woman"));
        let id = rec.job_id().unwrap();
        let ctx = JobContext::new(rec, id, &WorkspacePaths::default());
        assert_eq!(ctx.trigger, "ohwx woman");
    }
}
