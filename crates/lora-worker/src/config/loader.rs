use std::path::Path;

use secrecy::SecretString;

use crate::config::schema::{BlobBackend, WorkerConfig};
use crate::error::ConfigError;
use crate::secrets::SecretSource;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<WorkerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Parses a config document. Environment overrides are not applied.
pub fn load_config_from_str(content: &str) -> Result<WorkerConfig, ConfigError> {
    let config: WorkerConfig = serde_json::from_str(content)?;
    Ok(config)
}

/// File (if any), then process environment, then validation.
pub fn load_effective_config(path: Option<&Path>) -> Result<WorkerConfig, ConfigError> {
    let config = load_unvalidated_config(path)?;
    validate_config(&config)?;
    Ok(config)
}

/// File (if any), then process environment. For commands that only need a
/// slice of the settings.
pub fn load_unvalidated_config(path: Option<&Path>) -> Result<WorkerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => WorkerConfig::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Overlays the deployment environment variables onto `config`.
/// Empty values are ignored.
pub fn apply_env_overrides<F>(config: &mut WorkerConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| env(name).filter(|v| !v.trim().is_empty());

    if let Some(url) = get("SUPABASE_URL") {
        config.job_store.url = url.trim().trim_end_matches('/').to_string();
    }
    if let Some(model) = get("PRETRAINED_MODEL") {
        config.training.pretrained_model = model;
    }
    if let Some(vae) = get("VAE_PATH") {
        config.training.vae = Some(vae);
    }
    if let Some(bucket) = get("LORA_DATASET_BUCKET") {
        config.blob_store.dataset_bucket = bucket;
    }
    if let Some(prefix) = get("LORA_DATASET_PREFIX_ROOT") {
        config.dataset.prefix_root = prefix;
    }
    if let Some(bucket) = get("LORA_ARTIFACT_BUCKET") {
        config.blob_store.artifact_bucket = Some(bucket);
    }
}

pub fn validate_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    let url = config.job_store.url.trim();
    if url.is_empty() {
        return Err(ConfigError::Missing {
            name: "job_store.url (SUPABASE_URL)",
        });
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(invalid(format!("job_store.url must be http(s): {}", url)));
    }
    if config.job_store.table.trim().is_empty() {
        return Err(invalid("job_store.table must not be empty"));
    }
    if config.job_store.claim_batch_size == 0 {
        return Err(invalid("job_store.claim_batch_size must be at least 1"));
    }
    if !service_key_source(config).is_configured() {
        return Err(ConfigError::Missing {
            name: "job_store.service_key (SUPABASE_SERVICE_ROLE_KEY)",
        });
    }

    if config.training.pretrained_model.trim().is_empty() {
        return Err(ConfigError::Missing {
            name: "training.pretrained_model (PRETRAINED_MODEL)",
        });
    }
    if config.training.program.trim().is_empty() {
        return Err(invalid("training.program must not be empty"));
    }

    let dataset = &config.dataset;
    if dataset.min_images == 0 || dataset.min_images > dataset.max_images {
        return Err(invalid(format!(
            "dataset image bounds are invalid: [{}, {}]",
            dataset.min_images, dataset.max_images
        )));
    }
    if dataset.target_samples == 0 {
        return Err(invalid("dataset.target_samples must be at least 1"));
    }
    if dataset.image_extensions.is_empty() {
        return Err(invalid("dataset.image_extensions must not be empty"));
    }
    if dataset.concept.is_empty()
        || !dataset
            .concept
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid(format!(
            "dataset.concept must be a plain directory name: '{}'",
            dataset.concept
        )));
    }

    if config.blob_store.backend == BlobBackend::Local && config.blob_store.local_root.is_none() {
        return Err(ConfigError::Missing {
            name: "blob_store.local_root",
        });
    }
    if config.blob_store.page_size == 0 {
        return Err(invalid("blob_store.page_size must be at least 1"));
    }

    if config.artifact.min_bytes == 0 {
        return Err(invalid("artifact.min_bytes must be at least 1"));
    }

    let worker = &config.worker;
    if worker.poll_interval_secs == 0 {
        return Err(invalid("worker.poll_interval_secs must be at least 1"));
    }
    if worker.max_consecutive_poll_errors == 0 {
        return Err(invalid("worker.max_consecutive_poll_errors must be at least 1"));
    }
    if worker.stale_reclaim_after_secs == Some(0) {
        return Err(invalid("worker.stale_reclaim_after_secs must be positive when set"));
    }

    Ok(())
}

/// Resolves the service key used for both the job store and the blob store.
pub fn resolve_service_key(config: &WorkerConfig) -> Result<SecretString, ConfigError> {
    service_key_source(config)
        .resolve()
        .map_err(|source| ConfigError::Secret {
            name: "job_store.service_key",
            source,
        })
}

fn service_key_source(config: &WorkerConfig) -> SecretSource<'_> {
    SecretSource {
        direct: config.job_store.service_key.as_deref(),
        file: config.job_store.service_key_file.as_deref(),
        env_var: config.job_store.service_key_env_var.as_deref(),
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}
