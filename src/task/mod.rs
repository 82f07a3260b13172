// LLM task contract
//
// A task supplies data and persistence around a model: where training
// examples come from, how the adapter is configured, which items get
// evaluated and where predictions go. The classifier orchestrator only
// talks to this trait.

pub mod json_task;

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::TaskConfig;
use crate::models::{device_info, get_device_with_preference, DevicePreference, LlamaForSequenceClassification, LoRAConfig};

pub use json_task::JsonTask;

/// One labelled training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default)]
    pub instruction: String,
    pub input: String,
    pub output: String,
}

/// One item to classify; `ac_output` receives the prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalItem {
    #[serde(default)]
    pub instruction: String,
    pub input: String,
    /// Gold label, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ac_output: Option<String>,
    /// Fields carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EvalItem {
    pub fn new(instruction: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            input: input.into(),
            output: None,
            ac_output: None,
            extra: serde_json::Map::new(),
        }
    }

    /// `Some(true)` when a gold label exists and the prediction matches it
    pub fn is_correct(&self) -> Option<bool> {
        match (&self.output, &self.ac_output) {
            (Some(gold), Some(predicted)) => Some(gold == predicted),
            _ => None,
        }
    }
}

/// Where examples are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// A single `.json` (array) or `.jsonl` file
    File(PathBuf),
    /// A directory of data files, optionally one per iteration
    Directory(PathBuf),
}

impl DataSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            Self::Directory(path)
        } else {
            Self::File(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::File(p) | Self::Directory(p) => p,
        }
    }
}

/// Parameters of one generation run
#[derive(Debug, Clone, Default)]
pub struct EvalRequest {
    /// Ad-hoc single input; takes precedence over `source`
    pub instruction: Option<String>,
    pub input: Option<String>,
    pub source: Option<DataSource>,
    pub iteration: Option<usize>,
    pub test_iteration: Option<usize>,
}

/// Summary returned by `LlmTask::eval_output`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub total: usize,
    /// Items that carried a gold label
    pub labelled: usize,
    pub correct: usize,
    pub accuracy: Option<f64>,
    pub output_path: Option<PathBuf>,
}

impl EvalReport {
    pub fn from_items(items: &[EvalItem], output_path: Option<PathBuf>) -> Self {
        let judged: Vec<bool> = items.iter().filter_map(EvalItem::is_correct).collect();
        let correct = judged.iter().filter(|&&ok| ok).count();
        let accuracy = if judged.is_empty() {
            None
        } else {
            Some(correct as f64 / judged.len() as f64)
        };
        Self {
            total: items.len(),
            labelled: judged.len(),
            correct,
            accuracy,
            output_path,
        }
    }
}

/// Collaborator hooks around the classifier
pub trait LlmTask: Send + Sync {
    fn config(&self) -> &TaskConfig;

    /// Pick the compute device once per run
    fn auto_device(&self) -> Result<Device> {
        let settings = &self.config().device;
        let preference = if settings.use_mps_device && settings.preference == DevicePreference::Auto {
            DevicePreference::Metal
        } else {
            settings.preference
        };
        let device = get_device_with_preference(preference)?;
        tracing::info!(device = device_info(&device), "Selected compute device");
        Ok(device)
    }

    /// Training examples for `iteration` (or all of them)
    fn load_train_data(&self, source: &DataSource, iteration: Option<usize>) -> Result<Vec<Example>>;

    /// Attach LoRA adapters to a freshly loaded model
    fn load_adapter_config(&self, model: &mut LlamaForSequenceClassification) -> Result<LoRAConfig> {
        let config = self.config();
        let lora = LoRAConfig::from_settings(&config.lora, config.model.model_type, &config.model.base_model);
        model.apply_adapter(&lora)?;
        Ok(lora)
    }

    /// Items to classify for this request
    fn get_eval_input(&self, request: &EvalRequest) -> Result<Vec<EvalItem>>;

    /// Persist or report annotated items
    fn eval_output(&self, items: &[EvalItem], request: &EvalRequest) -> Result<EvalReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_item_keeps_extra_fields() {
        let raw = r#"{"instruction": "", "input": "great film", "output": "positive", "id": 17}"#;
        let mut item: EvalItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.extra.get("id"), Some(&serde_json::json!(17)));

        item.ac_output = Some("positive".to_string());
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["id"], 17);
        assert_eq!(json["ac_output"], "positive");
    }

    #[test]
    fn test_report_accuracy_ignores_unlabelled() {
        let mut a = EvalItem::new("", "x");
        a.output = Some("positive".to_string());
        a.ac_output = Some("positive".to_string());
        let mut b = EvalItem::new("", "y");
        b.output = Some("negative".to_string());
        b.ac_output = Some("positive".to_string());
        let mut c = EvalItem::new("", "z");
        c.ac_output = Some("negative".to_string());

        let report = EvalReport::from_items(&[a, b, c], None);
        assert_eq!(report.total, 3);
        assert_eq!(report.labelled, 2);
        assert_eq!(report.correct, 1);
        assert_eq!(report.accuracy, Some(0.5));
    }

    #[test]
    fn test_report_without_labels_has_no_accuracy() {
        let report = EvalReport::from_items(&[EvalItem::new("", "x")], None);
        assert_eq!(report.accuracy, None);
    }
}
