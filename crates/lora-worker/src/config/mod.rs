pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, load_config, load_config_from_str, load_effective_config,
    load_unvalidated_config, resolve_service_key, validate_config,
};
pub use schema::{
    ArtifactConfig, BlobBackend, BlobStoreConfig, DatasetConfig, JobStoreConfig, TrainingConfig,
    WorkerConfig, WorkerSettings,
};
