// Training arguments handed to the trainer

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::schedule::StepPlan;
use crate::config::TaskConfig;

/// When evaluation or saving happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStrategy {
    No,
    Steps,
}

/// Retention limit applied to checkpoint directories
pub const SAVE_TOTAL_LIMIT: usize = 11;

pub const TRAINING_ARGS_FILE: &str = "training_args.json";

/// Arguments for one training run.
///
/// `fp16`, `optim`, `save_strategy`, `use_mps_device` and
/// `ddp_find_unused_parameters` are a record of the run: precision and device
/// are fixed when the model is loaded, and the trainer always uses AdamW with
/// step-based saving. They are written to `training_args.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArguments {
    pub per_device_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub warmup_steps: usize,
    pub num_train_epochs: usize,
    pub learning_rate: f64,
    pub fp16: bool,
    pub optim: String,
    pub logging_steps: usize,
    pub evaluation_strategy: IntervalStrategy,
    pub save_strategy: IntervalStrategy,
    pub eval_steps: Option<usize>,
    pub save_steps: usize,
    pub output_dir: PathBuf,
    pub save_total_limit: usize,
    pub load_best_model_at_end: bool,
    pub metric_for_best_model: String,
    pub greater_is_better: bool,
    pub ddp_find_unused_parameters: Option<bool>,
    pub group_by_length: bool,
    pub use_mps_device: bool,
    /// JSONL metrics sink; `None` opts out of tracking
    pub report_to: Option<PathBuf>,
    pub seed: u64,
    pub max_grad_norm: f64,
    pub weight_decay: f64,
}

impl TrainingArguments {
    pub fn from_config(config: &TaskConfig, plan: &StepPlan, has_validation: bool) -> Self {
        let training = &config.training;
        let report_to = (!config.tracking.disable_tracking)
            .then(|| training.output_dir.join(&config.tracking.metrics_file));

        Self {
            per_device_train_batch_size: training.per_gpu_train_batch_size,
            gradient_accumulation_steps: training.gradient_accumulation_steps,
            warmup_steps: plan.warmup_steps,
            num_train_epochs: training.epochs,
            learning_rate: training.learning_rate,
            fp16: training.is_fp16,
            optim: "adamw".to_string(),
            logging_steps: training.logging_steps,
            evaluation_strategy: if has_validation {
                IntervalStrategy::Steps
            } else {
                IntervalStrategy::No
            },
            save_strategy: IntervalStrategy::Steps,
            eval_steps: has_validation.then_some(plan.eval_steps),
            save_steps: plan.save_steps,
            output_dir: training.output_dir.clone(),
            save_total_limit: training.save_total_limit,
            load_best_model_at_end: has_validation,
            metric_for_best_model: training.metric_for_best_model.clone(),
            greater_is_better: !training.metric_for_best_model.ends_with("loss"),
            ddp_find_unused_parameters: config.ddp().then_some(false),
            group_by_length: training.group_by_length,
            use_mps_device: config.device.use_mps_device,
            report_to,
            seed: training.seed,
            max_grad_norm: training.max_grad_norm,
            weight_decay: training.weight_decay,
        }
    }

    /// Save cadence with a zero step count raised to every step
    pub fn effective_save_steps(&self) -> usize {
        self.save_steps.max(1)
    }

    /// Whether `candidate` beats the best value seen so far
    pub fn is_better(&self, candidate: f64, best: Option<f64>) -> bool {
        match best {
            None => true,
            Some(best) if self.greater_is_better => candidate > best,
            Some(best) => candidate < best,
        }
    }

    /// Write `training_args.json` into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        let path = dir.join(TRAINING_ARGS_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))
    }

    /// Eval cadence, `None` when evaluation is off
    pub fn effective_eval_steps(&self) -> Option<usize> {
        match self.evaluation_strategy {
            IntervalStrategy::Steps => Some(self.eval_steps.unwrap_or(self.save_steps).max(1)),
            IntervalStrategy::No => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValSetSize;

    fn config() -> TaskConfig {
        let mut config = TaskConfig::new("models/tiny", vec!["a".into(), "b".into()]);
        config.training.per_gpu_train_batch_size = 4;
        config.training.gradient_accumulation_steps = 2;
        config
    }

    #[test]
    fn test_validation_gates_eval_and_best_model() {
        let mut config = config();
        let plan = StepPlan::compute(4, 2, 1, false, 100);

        let args = TrainingArguments::from_config(&config, &plan, false);
        assert_eq!(args.evaluation_strategy, IntervalStrategy::No);
        assert_eq!(args.eval_steps, None);
        assert!(!args.load_best_model_at_end);
        assert_eq!(args.effective_eval_steps(), None);

        config.training.val_set_size = ValSetSize::Count(10);
        let args = TrainingArguments::from_config(&config, &plan, true);
        assert_eq!(args.evaluation_strategy, IntervalStrategy::Steps);
        assert_eq!(args.eval_steps, Some(1));
        assert!(args.load_best_model_at_end);
        assert_eq!(args.save_total_limit, SAVE_TOTAL_LIMIT);
    }

    #[test]
    fn test_ddp_and_tracking_flags() {
        let mut config = config();
        let plan = StepPlan::compute(4, 2, 1, false, 10);
        let args = TrainingArguments::from_config(&config, &plan, false);
        assert_eq!(args.ddp_find_unused_parameters, None);
        assert!(args.report_to.is_none());
        assert_eq!(args.effective_save_steps(), 1);

        config.distributed.world_size = 2;
        config.tracking.disable_tracking = false;
        let args = TrainingArguments::from_config(&config, &plan, false);
        assert_eq!(args.ddp_find_unused_parameters, Some(false));
        assert_eq!(
            args.report_to,
            Some(config.training.output_dir.join("metrics.jsonl"))
        );
    }

    #[test]
    fn test_best_metric_direction_follows_metric_name() {
        let mut config = config();
        let plan = StepPlan::compute(4, 2, 1, false, 100);

        let args = TrainingArguments::from_config(&config, &plan, true);
        assert_eq!(args.metric_for_best_model, "eval_loss");
        assert!(!args.greater_is_better);
        assert!(args.is_better(0.4, Some(0.5)));
        assert!(!args.is_better(0.6, Some(0.5)));
        assert!(args.is_better(9.0, None));

        config.training.metric_for_best_model = "eval_accuracy".to_string();
        let args = TrainingArguments::from_config(&config, &plan, true);
        assert!(args.greater_is_better);
        assert!(args.is_better(0.8, Some(0.5)));
        assert!(!args.is_better(0.5, Some(0.5)));
    }

    #[test]
    fn test_save_writes_training_args_json() {
        let dir = tempfile::tempdir().unwrap();
        let plan = StepPlan::compute(4, 2, 1, false, 100);
        let args = TrainingArguments::from_config(&config(), &plan, false);
        args.save(dir.path()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(TRAINING_ARGS_FILE)).unwrap();
        let saved: TrainingArguments = serde_json::from_str(&raw).unwrap();
        assert_eq!(saved.optim, "adamw");
        assert_eq!(saved.save_strategy, IntervalStrategy::Steps);
        assert_eq!(saved.warmup_steps, plan.warmup_steps);
    }
}
