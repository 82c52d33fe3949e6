use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dataset::scaling::RoundingMode;
use crate::layout::WorkspacePaths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub job_store: JobStoreConfig,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub artifact: ArtifactConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    /// Project URL; the REST API lives at `<url>/rest/v1`.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub service_key: Option<String>,
    #[serde(default)]
    pub service_key_file: Option<String>,
    #[serde(default = "default_service_key_env_var")]
    pub service_key_env_var: Option<String>,
    #[serde(default = "default_owner_column")]
    pub owner_column: String,
    #[serde(default = "default_artifact_column")]
    pub artifact_column: String,
    #[serde(default = "default_store_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_drift_retries")]
    pub max_drift_retries: usize,
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
}

fn default_table() -> String {
    "user_loras".to_string()
}

fn default_service_key_env_var() -> Option<String> {
    Some("SUPABASE_SERVICE_ROLE_KEY".to_string())
}

fn default_owner_column() -> String {
    "owner_id".to_string()
}

fn default_artifact_column() -> String {
    "artifact_reference".to_string()
}

fn default_store_timeout() -> u64 {
    10
}

fn default_max_drift_retries() -> usize {
    5
}

fn default_claim_batch_size() -> usize {
    10
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            table: default_table(),
            service_key: None,
            service_key_file: None,
            service_key_env_var: default_service_key_env_var(),
            owner_column: default_owner_column(),
            artifact_column: default_artifact_column(),
            request_timeout_secs: default_store_timeout(),
            max_drift_retries: default_max_drift_retries(),
            claim_batch_size: default_claim_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackend {
    /// Storage REST API on the job store's project URL (or `url`).
    #[default]
    StorageApi,
    /// Buckets are directories under `local_root`.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    #[serde(default)]
    pub backend: BlobBackend,
    /// Overrides the job store URL for storage requests.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub local_root: Option<PathBuf>,
    #[serde(default = "default_dataset_bucket")]
    pub dataset_bucket: String,
    /// Artifacts are uploaded only when a bucket is set; otherwise the local
    /// file path is recorded as the reference.
    #[serde(default)]
    pub artifact_bucket: Option<String>,
    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_blob_timeout")]
    pub request_timeout_secs: u64,
}

fn default_dataset_bucket() -> String {
    "lora-datasets".to_string()
}

fn default_artifact_prefix() -> String {
    "loras".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_blob_timeout() -> u64 {
    120
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackend::default(),
            url: None,
            local_root: None,
            dataset_bucket: default_dataset_bucket(),
            artifact_bucket: None,
            artifact_prefix: default_artifact_prefix(),
            page_size: default_page_size(),
            request_timeout_secs: default_blob_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Objects for job `<id>` live under `<prefix_root>/<id>/`.
    #[serde(default = "default_prefix_root")]
    pub prefix_root: String,
    #[serde(default = "default_min_images")]
    pub min_images: usize,
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    #[serde(default = "default_target_samples")]
    pub target_samples: u32,
    #[serde(default)]
    pub rounding: RoundingMode,
    #[serde(default = "default_concept")]
    pub concept: String,
    /// Appended to the trigger token in every caption.
    #[serde(default)]
    pub caption_description: Option<String>,
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_prefix_root() -> String {
    "lora_datasets".to_string()
}

fn default_min_images() -> usize {
    10
}

fn default_max_images() -> usize {
    20
}

fn default_target_samples() -> u32 {
    1200
}

fn default_concept() -> String {
    "concept".to_string()
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            prefix_root: default_prefix_root(),
            min_images: default_min_images(),
            max_images: default_max_images(),
            target_samples: default_target_samples(),
            rounding: RoundingMode::default(),
            concept: default_concept(),
            caption_description: None,
            image_extensions: default_image_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_script")]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub pretrained_model: String,
    #[serde(default)]
    pub vae: Option<String>,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_batch_size")]
    pub train_batch_size: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: String,
    #[serde(default = "default_network_dim")]
    pub network_dim: u32,
    #[serde(default = "default_network_alpha")]
    pub network_alpha: u32,
    #[serde(default = "default_mixed_precision")]
    pub mixed_precision: String,
    #[serde(default = "default_network_module")]
    pub network_module: Option<String>,
    #[serde(default = "default_true")]
    pub enable_bucket: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Output lines containing any of these fail the run even on exit 0.
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,
}

fn default_program() -> String {
    "python3".to_string()
}

fn default_script() -> Option<PathBuf> {
    Some(PathBuf::from("/workspace/sd-scripts/sdxl_train_network.py"))
}

fn default_resolution() -> String {
    "1024,1024".to_string()
}

fn default_batch_size() -> u32 {
    1
}

fn default_learning_rate() -> String {
    "1e-4".to_string()
}

fn default_network_dim() -> u32 {
    64
}

fn default_network_alpha() -> u32 {
    32
}

fn default_mixed_precision() -> String {
    "fp16".to_string()
}

fn default_network_module() -> Option<String> {
    Some("networks.lora".to_string())
}

fn default_true() -> bool {
    true
}

fn default_failure_markers() -> Vec<String> {
    vec!["No data found".to_string()]
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: default_script(),
            working_dir: None,
            pretrained_model: String::new(),
            vae: None,
            resolution: default_resolution(),
            train_batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            network_dim: default_network_dim(),
            network_alpha: default_network_alpha(),
            mixed_precision: default_mixed_precision(),
            network_module: default_network_module(),
            enable_bucket: true,
            extra_args: Vec::new(),
            failure_markers: default_failure_markers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default = "default_min_bytes")]
    pub min_bytes: u64,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_min_bytes() -> u64 {
    1024 * 1024
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/workspace/lora_cache")
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            min_bytes: default_min_bytes(),
            cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub paths: WorkspacePaths,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_idle_log_interval")]
    pub idle_log_interval_secs: u64,
    #[serde(default = "default_max_poll_errors")]
    pub max_consecutive_poll_errors: u32,
    /// Reclaim `training` jobs untouched for this long. Off when absent.
    #[serde(default)]
    pub stale_reclaim_after_secs: Option<u64>,
    #[serde(default = "default_max_error_message_len")]
    pub max_error_message_len: usize,
    #[serde(default = "default_final_write_attempts")]
    pub final_write_attempts: u32,
    #[serde(default = "default_final_write_retry_ms")]
    pub final_write_retry_ms: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_idle_log_interval() -> u64 {
    30
}

fn default_max_poll_errors() -> u32 {
    5
}

fn default_max_error_message_len() -> usize {
    500
}

fn default_final_write_attempts() -> u32 {
    3
}

fn default_final_write_retry_ms() -> u64 {
    2000
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            paths: WorkspacePaths::default(),
            poll_interval_secs: default_poll_interval(),
            idle_log_interval_secs: default_idle_log_interval(),
            max_consecutive_poll_errors: default_max_poll_errors(),
            stale_reclaim_after_secs: None,
            max_error_message_len: default_max_error_message_len(),
            final_write_attempts: default_final_write_attempts(),
            final_write_retry_ms: default_final_write_retry_ms(),
        }
    }
}
