//! Configuration parsing and validation.
//!
//! [`StrategyConfig`] carries the minibatch/epoch/device settings every strategy
//! forwards to the base training loop. [`ExperimentConfig`] is the YAML document
//! consumed by the `continual` binary.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{ContinualError, Result};
use crate::model::SimpleMlpConfig;
use crate::optimizer::OptimizerConfig;

/// Training-loop settings shared by every strategy.
///
/// # Example
///
/// ```rust
/// use continual_rs::StrategyConfig;
///
/// let config = StrategyConfig {
///     train_mb_size: 32,
///     train_epochs: 4,
///     ..Default::default()
/// };
///
/// assert_eq!(config.test_mb_size(), 32);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Training minibatch size.
    #[serde(default = "default_mb_size")]
    pub train_mb_size: usize,

    /// Number of epochs per training experience.
    #[serde(default = "default_epochs")]
    pub train_epochs: usize,

    /// Test minibatch size. Falls back to `train_mb_size` when unset.
    #[serde(default)]
    pub test_mb_size: Option<usize>,

    /// Device for minibatches. Falls back to the model's device when unset.
    #[serde(default)]
    pub device: Option<DeviceSetting>,

    /// Seed for minibatch shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Shuffle training minibatches every epoch.
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Log the running loss every N iterations.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// Draw an indicatif progress bar while training.
    #[serde(default)]
    pub show_progress: bool,
}

fn default_mb_size() -> usize {
    1
}
fn default_epochs() -> usize {
    1
}
fn default_seed() -> u64 {
    42
}
fn default_true() -> bool {
    true
}
fn default_log_steps() -> usize {
    10
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            train_mb_size: default_mb_size(),
            train_epochs: default_epochs(),
            test_mb_size: None,
            device: None,
            seed: default_seed(),
            shuffle: true,
            logging_steps: default_log_steps(),
            show_progress: false,
        }
    }
}

impl StrategyConfig {
    /// Effective test minibatch size.
    #[must_use]
    pub fn test_mb_size(&self) -> usize {
        self.test_mb_size.unwrap_or(self.train_mb_size)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.train_mb_size == 0 {
            return Err(ContinualError::Config("train_mb_size must be > 0".into()));
        }
        if self.train_epochs == 0 {
            return Err(ContinualError::Config("train_epochs must be > 0".into()));
        }
        if self.test_mb_size == Some(0) {
            return Err(ContinualError::Config("test_mb_size must be > 0".into()));
        }
        if self.logging_steps == 0 {
            return Err(ContinualError::Config("logging_steps must be > 0".into()));
        }
        Ok(())
    }
}

/// Device selector, written as `cpu`, `cuda` or `cuda:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSetting {
    /// Host CPU.
    Cpu,
    /// CUDA device by ordinal.
    Cuda(usize),
}

impl DeviceSetting {
    /// Resolve to a candle device.
    ///
    /// CUDA requests fall back to the CPU when the `cuda` feature is disabled or
    /// no device is present.
    pub fn resolve(&self) -> Result<Device> {
        match *self {
            DeviceSetting::Cpu => Ok(Device::Cpu),
            DeviceSetting::Cuda(ordinal) => match Device::cuda_if_available(ordinal) {
                Ok(device @ Device::Cuda(_)) => {
                    tracing::info!("Training device: CUDA (device {})", ordinal);
                    Ok(device)
                }
                Ok(_) => {
                    tracing::warn!("CUDA not available; falling back to CPU.");
                    Ok(Device::Cpu)
                }
                Err(err) => {
                    tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
                    Ok(Device::Cpu)
                }
            },
        }
    }
}

impl fmt::Display for DeviceSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSetting::Cpu => write!(f, "cpu"),
            DeviceSetting::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for DeviceSetting {
    type Err = ContinualError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(DeviceSetting::Cpu),
            "cuda" | "gpu" => Ok(DeviceSetting::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse::<usize>().ok())
                .map(DeviceSetting::Cuda)
                .ok_or_else(|| ContinualError::Config(format!("Unknown device: {other}"))),
        }
    }
}

impl TryFrom<String> for DeviceSetting {
    type Error = ContinualError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceSetting> for String {
    fn from(value: DeviceSetting) -> Self {
        value.to_string()
    }
}

/// Which strategy an experiment runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum StrategySettings {
    /// Plain fine-tuning.
    #[default]
    Naive,
    /// Fine-tuning with one classifier head per task.
    MtNaive {
        /// Name of the output layer.
        #[serde(default = "default_classifier_field")]
        classifier_field: String,
        /// Keep the initial output layer for task 0.
        #[serde(default)]
        keep_initial_layer: bool,
    },
    /// CWR* weight consolidation.
    CwrStar {
        /// Layer just before the classifier.
        second_last_layer_name: String,
        /// Total number of classes.
        #[serde(default = "default_cwr_classes")]
        num_classes: usize,
    },
}

impl StrategySettings {
    /// Name used in configs and reports.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            StrategySettings::Naive => "naive",
            StrategySettings::MtNaive { .. } => "mt_naive",
            StrategySettings::CwrStar { .. } => "cwr_star",
        }
    }
}

pub(crate) fn default_classifier_field() -> String {
    "classifier".into()
}
pub(crate) fn default_cwr_classes() -> usize {
    50
}

/// Where the benchmark data comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BenchmarkSource {
    /// Seeded Gaussian class clusters.
    Synthetic {
        /// Number of classes.
        #[serde(default = "default_synthetic_classes")]
        num_classes: usize,
        /// Feature dimension.
        #[serde(default = "default_input_size")]
        input_size: usize,
        /// Training samples per class.
        #[serde(default = "default_train_per_class")]
        train_per_class: usize,
        /// Test samples per class.
        #[serde(default = "default_test_per_class")]
        test_per_class: usize,
        /// Standard deviation of the class centers.
        #[serde(default = "default_separation")]
        separation: f32,
    },
    /// JSON-lines files of `{"features": [...], "label": n}` records.
    Jsonl {
        /// Training split.
        train_path: String,
        /// Test split.
        test_path: String,
    },
}

fn default_synthetic_classes() -> usize {
    10
}
fn default_input_size() -> usize {
    16
}
fn default_train_per_class() -> usize {
    100
}
fn default_test_per_class() -> usize {
    50
}
fn default_separation() -> f32 {
    4.0
}

impl Default for BenchmarkSource {
    fn default() -> Self {
        BenchmarkSource::Synthetic {
            num_classes: default_synthetic_classes(),
            input_size: default_input_size(),
            train_per_class: default_train_per_class(),
            test_per_class: default_test_per_class(),
            separation: default_separation(),
        }
    }
}

/// Benchmark construction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Data source.
    #[serde(default)]
    pub source: BenchmarkSource,

    /// Number of experiences the class set is split into.
    #[serde(default = "default_n_experiences")]
    pub n_experiences: usize,

    /// Give each experience its own task label.
    #[serde(default)]
    pub task_labels: bool,

    /// Fixed class order; shuffled with `seed` when unset.
    #[serde(default)]
    pub class_order: Option<Vec<u32>>,

    /// Seed for class-order shuffling and synthetic data.
    #[serde(default = "default_benchmark_seed")]
    pub seed: u64,
}

fn default_n_experiences() -> usize {
    5
}
fn default_benchmark_seed() -> u64 {
    1234
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            source: BenchmarkSource::default(),
            n_experiences: default_n_experiences(),
            task_labels: false,
            class_order: None,
            seed: default_benchmark_seed(),
        }
    }
}

/// Full experiment description for the `continual` binary.
///
/// # Example
///
/// ```rust
/// use continual_rs::ExperimentConfig;
///
/// # fn main() -> continual_rs::Result<()> {
/// let config = ExperimentConfig::from_preset("cwr-star-mlp")?;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Strategy to run.
    #[serde(default)]
    pub strategy: StrategySettings,

    /// Model architecture.
    #[serde(default)]
    pub model: SimpleMlpConfig,

    /// Optimizer.
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Training-loop settings.
    #[serde(default)]
    pub training: StrategyConfig,

    /// Benchmark.
    #[serde(default)]
    pub benchmark: BenchmarkConfig,

    /// Directory for `report.json` and `model.safetensors`.
    #[serde(default)]
    pub output_dir: Option<String>,
}

impl ExperimentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets: `"naive-mlp"`, `"mt-naive-mlp"`, `"cwr-star-mlp"`.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "naive-mlp" => Ok(Self::naive_preset()),
            "mt-naive-mlp" => Ok(Self::mt_naive_preset()),
            "cwr-star-mlp" => Ok(Self::cwr_star_preset()),
            _ => Err(ContinualError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Naive fine-tuning of a one-hidden-layer MLP on a class-incremental split.
    #[must_use]
    pub fn naive_preset() -> Self {
        Self {
            strategy: StrategySettings::Naive,
            model: SimpleMlpConfig::default(),
            optimizer: OptimizerConfig::default(),
            training: StrategyConfig {
                train_mb_size: 32,
                train_epochs: 4,
                test_mb_size: Some(128),
                ..Default::default()
            },
            benchmark: BenchmarkConfig::default(),
            output_dir: Some("./outputs/naive-mlp".into()),
        }
    }

    /// Multi-head fine-tuning on a task-incremental split.
    #[must_use]
    pub fn mt_naive_preset() -> Self {
        Self {
            strategy: StrategySettings::MtNaive {
                classifier_field: default_classifier_field(),
                keep_initial_layer: false,
            },
            benchmark: BenchmarkConfig {
                task_labels: true,
                ..Default::default()
            },
            output_dir: Some("./outputs/mt-naive-mlp".into()),
            ..Self::naive_preset()
        }
    }

    /// CWR* on a class-incremental split.
    #[must_use]
    pub fn cwr_star_preset() -> Self {
        let model = SimpleMlpConfig::default();
        Self {
            strategy: StrategySettings::CwrStar {
                second_last_layer_name: "features.0".into(),
                num_classes: model.num_classes,
            },
            model,
            output_dir: Some("./outputs/cwr-star-mlp".into()),
            ..Self::naive_preset()
        }
    }

    /// Validate the configuration.
    ///
    /// ```rust
    /// use continual_rs::ExperimentConfig;
    ///
    /// let mut config = ExperimentConfig::from_preset("naive-mlp").unwrap();
    /// config.benchmark.n_experiences = 0;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        self.model.validate()?;
        self.optimizer.validate()?;

        if self.benchmark.n_experiences == 0 {
            return Err(ContinualError::Config(
                "benchmark.n_experiences must be > 0".into(),
            ));
        }

        if let BenchmarkSource::Synthetic {
            num_classes,
            input_size,
            train_per_class,
            test_per_class,
            ..
        } = &self.benchmark.source
        {
            if *input_size != self.model.input_size {
                return Err(ContinualError::Config(format!(
                    "benchmark input_size {} does not match model.input_size {}",
                    input_size, self.model.input_size
                )));
            }
            if *num_classes > self.model.num_classes {
                return Err(ContinualError::Config(format!(
                    "benchmark has {} classes but the model only {} outputs",
                    num_classes, self.model.num_classes
                )));
            }
            if *num_classes % self.benchmark.n_experiences != 0 {
                return Err(ContinualError::Config(format!(
                    "{} classes cannot be split evenly into {} experiences",
                    num_classes, self.benchmark.n_experiences
                )));
            }
            if *train_per_class == 0 || *test_per_class == 0 {
                return Err(ContinualError::Config(
                    "samples per class must be > 0".into(),
                ));
            }
        }

        match &self.strategy {
            StrategySettings::Naive => {}
            StrategySettings::MtNaive {
                classifier_field, ..
            } => {
                if classifier_field.is_empty() {
                    return Err(ContinualError::Config(
                        "strategy.classifier_field is required".into(),
                    ));
                }
                if !self.benchmark.task_labels {
                    tracing::warn!(
                        "mt_naive without task labels trains a single head for every experience"
                    );
                }
            }
            StrategySettings::CwrStar {
                second_last_layer_name,
                num_classes,
            } => {
                if second_last_layer_name.is_empty() {
                    return Err(ContinualError::Config(
                        "strategy.second_last_layer_name is required".into(),
                    ));
                }
                if *num_classes == 0 || *num_classes > self.model.num_classes {
                    return Err(ContinualError::Config(format!(
                        "strategy.num_classes must be in 1..={}",
                        self.model.num_classes
                    )));
                }
            }
        }

        Ok(())
    }
}
