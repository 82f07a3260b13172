// Configuration structs
//
// A `TaskConfig` is built once per run and handed by reference to every
// component. Nothing mutates it after loading.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::ClassifyError;
use crate::models::DevicePreference;

/// Sentinel for "no trained adapter" in `ModelSettings::adapter_weights`
pub const NO_ADAPTER: &str = "None";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub model: ModelSettings,
    pub lora: LoraSettings,
    pub training: TrainingSettings,
    pub checkpoint: CheckpointSettings,
    pub device: DeviceSettings,
    pub distributed: DistributedSettings,
    pub tracking: TrackingSettings,
    pub data: DataSettings,
    /// Ordered label vocabulary; the index of a label is its class id
    pub labels: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            lora: LoraSettings::default(),
            training: TrainingSettings::default(),
            checkpoint: CheckpointSettings::default(),
            device: DeviceSettings::default(),
            distributed: DistributedSettings::default(),
            tracking: TrackingSettings::default(),
            data: DataSettings::default(),
            labels: Vec::new(),
        }
    }
}

impl TaskConfig {
    pub fn new(base_model: impl Into<String>, labels: Vec<String>) -> Self {
        let mut config = Self::default();
        config.model.base_model = base_model.into();
        config.labels = labels;
        config
    }

    /// Check the invariants the pipeline relies on
    pub fn validate(&self) -> Result<(), ClassifyError> {
        if self.model.base_model.trim().is_empty() {
            return Err(ClassifyError::InvalidConfig(
                "model.base_model must name a model directory or hub repository".to_string(),
            ));
        }
        if self.labels.is_empty() {
            return Err(ClassifyError::InvalidConfig(
                "labels must contain at least one category".to_string(),
            ));
        }
        for (i, label) in self.labels.iter().enumerate() {
            if self.labels[..i].contains(label) {
                return Err(ClassifyError::InvalidConfig(format!(
                    "label '{}' appears more than once",
                    label
                )));
            }
        }
        if self.training.per_gpu_train_batch_size == 0 {
            return Err(ClassifyError::InvalidConfig(
                "training.per_gpu_train_batch_size must be positive".to_string(),
            ));
        }
        if self.training.gradient_accumulation_steps == 0 {
            return Err(ClassifyError::InvalidConfig(
                "training.gradient_accumulation_steps must be positive".to_string(),
            ));
        }
        if self.training.epochs == 0 {
            return Err(ClassifyError::InvalidConfig(
                "training.epochs must be positive".to_string(),
            ));
        }
        if let ValSetSize::Fraction(f) = self.training.val_set_size {
            if !(0.0..1.0).contains(&f) {
                return Err(ClassifyError::InvalidConfig(format!(
                    "training.val_set_size fraction {} must be in [0, 1)",
                    f
                )));
            }
        }
        if !matches!(
            self.training.metric_for_best_model.trim_start_matches("eval_"),
            "loss" | "accuracy"
        ) {
            return Err(ClassifyError::InvalidConfig(format!(
                "training.metric_for_best_model '{}' must be eval_loss or eval_accuracy",
                self.training.metric_for_best_model
            )));
        }
        if self.lora.r == 0 {
            return Err(ClassifyError::InvalidConfig("lora.r must be positive".to_string()));
        }
        if self.model.max_length == 0 {
            return Err(ClassifyError::InvalidConfig(
                "model.max_length must be positive".to_string(),
            ));
        }
        if self.distributed.world_size == 0 {
            return Err(ClassifyError::InvalidConfig(
                "distributed.world_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether distributed data-parallel training is active
    pub fn ddp(&self) -> bool {
        self.distributed.world_size != 1
    }

    /// Whether a trained adapter should be layered on the base model
    pub fn has_adapter_weights(&self) -> bool {
        let path = self.model.adapter_weights.trim();
        !path.is_empty() && !path.eq_ignore_ascii_case(NO_ADAPTER)
    }
}

/// Model family, used to pick default LoRA target modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    #[default]
    Llama,
    Llama2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Local model directory or HuggingFace repository id
    pub base_model: String,
    pub model_type: ModelFamily,
    /// Keep base projections 8-bit quantized
    pub load_8bit: bool,
    pub add_eos_token: bool,
    /// Truncation length for tokenized inputs
    pub max_length: usize,
    /// Directory with a trained adapter, or "None"
    pub adapter_weights: String,
    /// Hub revision to download (defaults to main)
    pub revision: Option<String>,
    /// Hub cache directory (defaults to ~/.cache/huggingface)
    pub cache_dir: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_model: String::new(),
            model_type: ModelFamily::Llama,
            load_8bit: false,
            add_eos_token: false,
            max_length: 512,
            adapter_weights: NO_ADAPTER.to_string(),
            revision: None,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraSettings {
    pub r: usize,
    pub alpha: f64,
    pub dropout: f64,
    /// Empty means "use the model family default"
    pub target_modules: Vec<String>,
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: Vec::new(),
        }
    }
}

/// Validation split size: an absolute row count or a fraction of the data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValSetSize {
    Count(usize),
    Fraction(f64),
}

impl Default for ValSetSize {
    fn default() -> Self {
        Self::Count(0)
    }
}

impl ValSetSize {
    pub fn is_enabled(&self) -> bool {
        match *self {
            Self::Count(n) => n > 0,
            Self::Fraction(f) => f > 0.0,
        }
    }

    /// Number of validation rows for a dataset of `total` rows
    pub fn rows_for(&self, total: usize) -> usize {
        match *self {
            Self::Count(n) => n,
            Self::Fraction(f) => (f * total as f64).ceil() as usize,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub per_gpu_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub is_fp16: bool,
    pub logging_steps: usize,
    pub val_set_size: ValSetSize,
    pub group_by_length: bool,
    pub output_dir: PathBuf,
    /// Checkpoint directory to resume from
    pub resume_from_checkpoint: Option<PathBuf>,
    pub save_total_limit: usize,
    pub seed: u64,
    pub max_grad_norm: f64,
    pub weight_decay: f64,
    /// Ahead-of-time weight preparation before training
    pub compile: bool,
    /// Validation metric that picks the best checkpoint: `eval_loss` or `eval_accuracy`
    pub metric_for_best_model: String,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            per_gpu_train_batch_size: 4,
            gradient_accumulation_steps: 8,
            epochs: 3,
            learning_rate: 3e-4,
            is_fp16: true,
            logging_steps: 10,
            val_set_size: ValSetSize::default(),
            group_by_length: false,
            output_dir: PathBuf::from("./lora-classify"),
            resume_from_checkpoint: None,
            save_total_limit: 11,
            seed: 42,
            max_grad_norm: 1.0,
            weight_decay: 0.0,
            compile: true,
            metric_for_best_model: "eval_loss".to_string(),
        }
    }
}

/// File names probed inside a resume checkpoint directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Full trainable-state snapshot written by the trainer
    pub full_model_file: String,
    /// Adapter-only snapshot written by `save_pretrained`
    pub adapter_file: String,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            full_model_file: "model.safetensors".to_string(),
            adapter_file: "adapter_model.safetensors".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceSettings {
    pub preference: DevicePreference,
    /// Prefer the Apple GPU (Metal) when available
    pub use_mps_device: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedSettings {
    /// Number of data-parallel processes (overridden by WORLD_SIZE)
    pub world_size: usize,
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self { world_size: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// Opt out of experiment tracking
    pub disable_tracking: bool,
    /// JSONL file (relative to the output directory) receiving metrics
    pub metrics_file: String,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            disable_tracking: true,
            metrics_file: "metrics.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DataSettings {
    /// Default training data source
    pub train_path: Option<PathBuf>,
    /// Default evaluation data source
    pub eval_path: Option<PathBuf>,
    /// Where annotated evaluation output goes (defaults to the output directory)
    pub eval_output_dir: Option<PathBuf>,
}
