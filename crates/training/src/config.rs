use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::{optimizer::LossScaleConfig, TrainingError};

/// Run configuration, loaded once and read-only for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub train: TrainConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        let train = &self.train;

        if train.epochs == 0 {
            errors.push("train.epochs must be greater than 0".to_string());
        }

        if train.batch_size == 0 {
            errors.push("train.batch_size must be greater than 0".to_string());
        }

        if train.learning_rate <= 0.0 {
            errors.push("train.learning_rate must be greater than 0".to_string());
        }

        if !(0.0 < train.lr_decay && train.lr_decay <= 1.0) {
            errors.push("train.lr_decay must be in (0, 1]".to_string());
        }

        for (idx, beta) in train.betas.iter().enumerate() {
            if !(0.0 < *beta && *beta < 1.0) {
                errors.push(format!("train.betas[{idx}] must be in (0, 1)"));
            }
        }

        if train.eps <= 0.0 {
            errors.push("train.eps must be greater than 0".to_string());
        }

        if train.weight_decay < 0.0 {
            errors.push("train.weight_decay must be >= 0".to_string());
        }

        if train.segment_size == 0 {
            errors.push("train.segment_size must be greater than 0".to_string());
        }

        if train.log_interval == 0 {
            errors.push("train.log_interval must be greater than 0".to_string());
        }

        if train.save_every_n_epochs == 0 {
            errors.push("train.save_every_n_epochs must be greater than 0".to_string());
        }

        if train.checkpoint_dir.as_os_str().is_empty() {
            errors.push("train.checkpoint_dir must not be empty".to_string());
        }

        if train.save_deployment_weights && train.deployment_dir.is_none() {
            errors.push(
                "train.deployment_dir is required when save_deployment_weights is enabled"
                    .to_string(),
            );
        }

        if train.experiment_name.trim().is_empty() {
            errors.push("train.experiment_name must not be empty".to_string());
        }

        if train.text_low_lr_rate <= 0.0 {
            errors.push("train.text_low_lr_rate must be greater than 0".to_string());
        }

        for group in &train.parameter_groups {
            if group.name.trim().is_empty() {
                errors.push("train.parameter_groups entries need a name".to_string());
            }
            if group.name == crate::params::BASE_GROUP {
                errors.push(format!(
                    "train.parameter_groups must not redeclare the implicit '{}' group",
                    crate::params::BASE_GROUP
                ));
            }
            if group.prefixes.is_empty() {
                errors.push(format!(
                    "train.parameter_groups.{} must list at least one prefix",
                    group.name
                ));
            }
            if let Some(multiplier) = group.lr_multiplier {
                if multiplier <= 0.0 {
                    errors.push(format!(
                        "train.parameter_groups.{}.lr_multiplier must be greater than 0",
                        group.name
                    ));
                }
            }
        }

        for (label, bound) in [
            ("grad_clip_discriminator", train.grad_clip_discriminator),
            ("grad_clip_generator", train.grad_clip_generator),
        ] {
            if let Some(value) = bound {
                if value < 0.0 {
                    errors.push(format!("train.{label} must be >= 0"));
                }
            }
        }

        if self.data.hop_length == 0 {
            errors.push("data.hop_length must be greater than 0".to_string());
        }

        if self.data.sampling_rate == 0 {
            errors.push("data.sampling_rate must be greater than 0".to_string());
        }

        if self.data.bucket_boundaries.is_empty() {
            errors.push("data.bucket_boundaries must not be empty".to_string());
        } else if self
            .data
            .bucket_boundaries
            .windows(2)
            .any(|pair| pair[0] >= pair[1])
        {
            errors.push("data.bucket_boundaries must be strictly increasing".to_string());
        }

        if self.data.prefetch_depth == 0 {
            errors.push("data.prefetch_depth must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.train.apply_base_path(base);
    }

    pub fn model_dtype(&self) -> DType {
        precision_to_dtype(self.train.precision)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,
    #[serde(default = "default_betas")]
    pub betas: [f64; 2],
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub precision: Precision,
    /// Training segment length in waveform samples.
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_save_every_n_epochs")]
    pub save_every_n_epochs: usize,
    #[serde(default)]
    pub retention: RetentionMode,
    #[serde(default)]
    pub save_deployment_weights: bool,
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub deployment_dir: Option<PathBuf>,
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default)]
    pub pretrained_generator: Option<PathBuf>,
    #[serde(default)]
    pub pretrained_discriminator: Option<PathBuf>,
    #[serde(default = "default_text_low_lr_rate")]
    pub text_low_lr_rate: f64,
    #[serde(default = "default_parameter_groups")]
    pub parameter_groups: Vec<ParameterGroupConfig>,
    /// Per-element gradient bound. Absent or `0.0` disables clipping.
    #[serde(default)]
    pub grad_clip_discriminator: Option<f64>,
    #[serde(default)]
    pub grad_clip_generator: Option<f64>,
    #[serde(default)]
    pub loss_weights: LossWeights,
    #[serde(default)]
    pub loss_scale: LossScaleConfig,
}

impl TrainConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint_dir, base);
        for path in [
            self.deployment_dir.as_mut(),
            self.pretrained_generator.as_mut(),
            self.pretrained_discriminator.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

/// Named prefix set sharing one learning-rate multiplier. A missing
/// multiplier means the group trains at `text_low_lr_rate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterGroupConfig {
    pub name: String,
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub lr_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LossWeights {
    #[serde(default = "one")]
    pub adversarial: f64,
    #[serde(default = "one")]
    pub feature_matching: f64,
    #[serde(default = "default_mel_weight")]
    pub mel: f64,
    #[serde(default = "one")]
    pub kl: f64,
    #[serde(default = "one")]
    pub commitment: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            adversarial: 1.0,
            feature_matching: 1.0,
            mel: default_mel_weight(),
            kl: 1.0,
            commitment: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_bucket_boundaries")]
    pub bucket_boundaries: Vec<usize>,
    /// Background collation threads. Zero collates on the training thread.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            hop_length: default_hop_length(),
            bucket_boundaries: default_bucket_boundaries(),
            num_workers: default_num_workers(),
            prefetch_depth: default_prefetch_depth(),
        }
    }
}

/// Architecture options. Carried into checkpoints untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    All,
    #[default]
    LatestOnly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    #[default]
    Fp16,
    Bf16,
    Mixed,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

pub fn precision_to_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Fp32 => DType::F32,
        Precision::Fp16 => DType::F16,
        Precision::Bf16 => DType::BF16,
        Precision::Mixed => DType::F32,
    }
}

fn one() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    1234
}

fn default_epochs() -> usize {
    100
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_lr_decay() -> f64 {
    0.999_875
}

fn default_betas() -> [f64; 2] {
    [0.8, 0.99]
}

fn default_eps() -> f64 {
    1e-9
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_segment_size() -> usize {
    20_480
}

fn default_log_interval() -> usize {
    100
}

fn default_save_every_n_epochs() -> usize {
    4
}

fn default_experiment_name() -> String {
    "experiment".to_string()
}

fn default_text_low_lr_rate() -> f64 {
    0.4
}

fn default_parameter_groups() -> Vec<ParameterGroupConfig> {
    vec![ParameterGroupConfig {
        name: "text".to_string(),
        prefixes: vec![
            "enc_p.text_embedding".to_string(),
            "enc_p.encoder_text".to_string(),
            "enc_p.mrte".to_string(),
        ],
        lr_multiplier: None,
    }]
}

fn default_mel_weight() -> f64 {
    45.0
}

fn default_sampling_rate() -> u32 {
    32_000
}

fn default_hop_length() -> usize {
    640
}

fn default_bucket_boundaries() -> Vec<usize> {
    let mut boundaries = vec![32];
    boundaries.extend((300..=1900).step_by(100));
    boundaries
}

fn default_num_workers() -> usize {
    2
}

fn default_prefetch_depth() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
[train]
checkpoint_dir = "logs/run"
precision = "fp32"

[model]
version = "v2"
inter_channels = 192
"#;

    #[test]
    fn loads_toml_with_defaults_and_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s2.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.train.checkpoint_dir, dir.path().join("logs/run"));
        assert_eq!(config.train.betas, [0.8, 0.99]);
        assert_eq!(config.train.retention, RetentionMode::LatestOnly);
        assert_eq!(config.data.bucket_boundaries.first(), Some(&32));
        assert_eq!(config.data.bucket_boundaries.last(), Some(&1900));
        assert_eq!(config.data.bucket_boundaries.len(), 18);
        assert_eq!(config.model.version.as_deref(), Some("v2"));
        assert_eq!(
            config.model.options.get("inter_channels"),
            Some(&serde_json::json!(192))
        );
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.train.batch_size = 0;
        config.train.save_deployment_weights = true;
        config.data.bucket_boundaries = vec![300, 32];

        let err = config.validate().unwrap_err();
        let TrainingError::Validation(messages) = err else {
            panic!("expected validation error");
        };
        assert_eq!(messages.len(), 3, "{messages:?}");
    }

    #[test]
    fn json_round_trips_through_loader() {
        let dir = tempdir().unwrap();
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        let path = dir.path().join("s2.json");
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(loaded.model, config.model);
        assert_eq!(loaded.train.loss_weights, LossWeights::default());
    }
}
