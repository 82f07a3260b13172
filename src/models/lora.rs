// LoRA (Low-Rank Adaptation) - Fine-tuning adapter for Llama projections

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::{LoraSettings, ModelFamily};

/// File written next to the adapter weights
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// LoRA adapter configuration
///
/// LoRA enables efficient fine-tuning of large models by learning low-rank
/// updates to weight matrices: `W x + (alpha / r) * B A x`, where only `A`
/// and `B` are trained and the base weight `W` stays frozen.
///
/// Serialized with the field names PEFT uses in `adapter_config.json`, so
/// adapter directories read naturally next to their Python counterparts.
///
/// # References
/// - Paper: "LoRA: Low-Rank Adaptation of Large Language Models" (Hu et al., 2021)
/// - https://arxiv.org/abs/2106.09685
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    /// Rank of the low-rank decomposition (typically 4-64)
    ///
    /// Lower rank = fewer parameters to train, but less expressive
    #[serde(rename = "r")]
    pub rank: usize,

    /// Scaling factor for LoRA updates; the effective scale is `alpha / rank`
    #[serde(rename = "lora_alpha")]
    pub alpha: f64,

    /// Dropout applied to the adapter input while training
    #[serde(rename = "lora_dropout")]
    pub dropout: f64,

    /// Projection names to adapt (e.g., ["q_proj", "v_proj"])
    pub target_modules: Vec<String>,

    /// Modules trained in full alongside the adapters
    #[serde(default = "default_modules_to_save")]
    pub modules_to_save: Vec<String>,

    #[serde(default = "default_task_type")]
    pub task_type: String,

    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

fn default_modules_to_save() -> Vec<String> {
    vec!["score".to_string()]
}

fn default_task_type() -> String {
    "SEQ_CLS".to_string()
}

impl Default for LoRAConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: default_target_modules(ModelFamily::Llama),
            modules_to_save: default_modules_to_save(),
            task_type: default_task_type(),
            base_model_name_or_path: None,
        }
    }
}

impl LoRAConfig {
    /// Build from configured settings, filling in family default targets
    pub fn from_settings(settings: &LoraSettings, family: ModelFamily, base_model: &str) -> Self {
        let target_modules = if settings.target_modules.is_empty() {
            default_target_modules(family)
        } else {
            settings.target_modules.clone()
        };

        Self {
            rank: settings.r,
            alpha: settings.alpha,
            dropout: settings.dropout,
            target_modules,
            modules_to_save: default_modules_to_save(),
            task_type: default_task_type(),
            base_model_name_or_path: Some(base_model.to_string()),
        }
    }

    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// Whether the projection called `name` gets an adapter
    pub fn targets(&self, name: &str) -> bool {
        self.target_modules.iter().any(|m| m == name)
    }

    /// Write `adapter_config.json` into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create adapter directory: {:?}", dir))?;
        let path = dir.join(ADAPTER_CONFIG_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize adapter config")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// Read `adapter_config.json` from `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read adapter config: {:?}", path))?;
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {:?}", path))
    }
}

/// Default target modules per model family.
///
/// Llama 2 runs adapt every attention and MLP projection; the older default
/// only touches the query and value projections.
pub fn default_target_modules(family: ModelFamily) -> Vec<String> {
    let names: &[&str] = match family {
        ModelFamily::Llama2 => &[
            "q_proj",
            "v_proj",
            "k_proj",
            "o_proj",
            "gate_proj",
            "down_proj",
            "up_proj",
        ],
        ModelFamily::Llama => &["q_proj", "v_proj"],
    };
    names.iter().map(|s| s.to_string()).collect()
}

/// Low-rank branch added to a frozen projection.
///
/// `A` starts Kaiming-uniform and `B` starts at zero, so a fresh adapter
/// leaves the base model output unchanged. Both live in f32 regardless of
/// the activation dtype.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    a: Tensor,
    b: Tensor,
    scaling: f64,
    dropout: f32,
}

impl LoraLinear {
    /// Create (or fetch) `lora_A.weight` / `lora_B.weight` under `vb`
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        config: &LoRAConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let a = vb.get_with_hints(
            (config.rank, in_dim),
            "lora_A.weight",
            candle_nn::init::DEFAULT_KAIMING_UNIFORM,
        )?;
        let b = vb.get_with_hints((out_dim, config.rank), "lora_B.weight", Init::Const(0.0))?;

        Ok(Self {
            a,
            b,
            scaling: config.scaling(),
            dropout: config.dropout as f32,
        })
    }

    pub fn rank(&self) -> usize {
        self.a.dims()[0]
    }

    /// `scaling * B(A(dropout(x)))`, returned in the dtype of `xs`
    pub fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let x = xs.to_dtype(DType::F32)?;
        let x = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&x, self.dropout)?
        } else {
            x
        };
        let hidden = x.broadcast_matmul(&self.a.t()?)?;
        let out = hidden.broadcast_matmul(&self.b.t()?)?;
        (out * self.scaling)?.to_dtype(xs.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_lora_config_default() {
        let config = LoRAConfig::default();
        assert_eq!(config.rank, 8);
        assert_eq!(config.scaling(), 2.0);
        assert_eq!(config.target_modules, vec!["q_proj", "v_proj"]);
        assert_eq!(config.modules_to_save, vec!["score"]);
    }

    #[test]
    fn test_llama2_targets_every_projection() {
        let targets = default_target_modules(ModelFamily::Llama2);
        assert_eq!(targets.len(), 7);
        for name in ["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"] {
            assert!(targets.iter().any(|t| t == name), "missing {}", name);
        }
    }

    #[test]
    fn test_explicit_targets_win_over_family_default() {
        let settings = LoraSettings {
            target_modules: vec!["o_proj".to_string()],
            ..LoraSettings::default()
        };
        let config = LoRAConfig::from_settings(&settings, ModelFamily::Llama2, "base");
        assert_eq!(config.target_modules, vec!["o_proj"]);
        assert!(config.targets("o_proj"));
        assert!(!config.targets("q_proj"));
    }

    #[test]
    fn test_adapter_config_uses_peft_field_names() {
        let dir = tempfile::tempdir().unwrap();
        LoRAConfig::default().save(dir.path()).unwrap();

        let raw = fs::read_to_string(dir.path().join(ADAPTER_CONFIG_FILE)).unwrap();
        assert!(raw.contains("\"lora_alpha\""));
        assert!(raw.contains("\"SEQ_CLS\""));

        let loaded = LoRAConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, LoRAConfig::default());
    }

    #[test]
    fn test_fresh_adapter_is_a_no_op() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let lora = LoraLinear::new(6, 4, &LoRAConfig::default(), vb.pp("q_proj")).unwrap();
        assert_eq!(lora.rank(), 8);

        let xs = Tensor::ones((2, 3, 6), DType::F32, &Device::Cpu).unwrap();
        let out = lora.forward(&xs, false).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
        let total: f32 = out.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 0.0);
        assert_eq!(varmap.all_vars().len(), 2);
    }
}
