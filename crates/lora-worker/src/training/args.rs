use std::path::PathBuf;

use crate::config::TrainingConfig;
use crate::dataset::DatasetDescriptor;
use crate::layout::JobLayout;

/// A fully enumerated trainer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl TrainingCommand {
    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

pub fn build_command(
    config: &TrainingConfig,
    dataset: &DatasetDescriptor,
    layout: &JobLayout,
) -> TrainingCommand {
    let mut args = Vec::new();
    if let Some(script) = &config.script {
        args.push(script.display().to_string());
    }

    let mut flag = |name: &str, value: String| {
        args.push(format!("--{}", name));
        args.push(value);
    };
    flag("pretrained_model_name_or_path", config.pretrained_model.clone());
    if let Some(vae) = &config.vae {
        flag("vae", vae.clone());
    }
    flag("train_data_dir", dataset.root.display().to_string());
    flag("output_dir", layout.output_dir().display().to_string());
    flag("output_name", layout.output_name().to_string());
    flag("resolution", config.resolution.clone());
    flag("train_batch_size", config.train_batch_size.to_string());
    flag("learning_rate", config.learning_rate.clone());
    if let Some(module) = &config.network_module {
        flag("network_module", module.clone());
    }
    flag("network_dim", config.network_dim.to_string());
    flag("network_alpha", config.network_alpha.to_string());
    flag("mixed_precision", config.mixed_precision.clone());
    flag("save_model_as", "safetensors".to_string());

    if config.enable_bucket {
        args.push("--enable_bucket".to_string());
    }
    args.extend(config.extra_args.iter().cloned());

    TrainingCommand {
        program: config.program.clone(),
        args,
        working_dir: config.working_dir.clone(),
    }
}
