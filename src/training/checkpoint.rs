// Checkpoint management: resume resolution, trainer state, rotation

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CheckpointSettings;
use crate::models::LlamaForSequenceClassification;

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One entry of the trainer's log history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_accuracy: Option<f64>,
}

impl LogEntry {
    pub fn new(step: usize, epoch: f64) -> Self {
        Self {
            step,
            epoch,
            timestamp: Utc::now(),
            loss: None,
            learning_rate: None,
            grad_norm: None,
            eval_loss: None,
            eval_accuracy: None,
        }
    }
}

/// Trainer bookkeeping written into every checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<PathBuf>,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(TRAINER_STATE_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize trainer state")?;
        fs::write(&path, json).with_context(|| format!("Failed to write trainer state: {:?}", path))
    }

    /// `None` when the directory holds no trainer state
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(TRAINER_STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read trainer state: {:?}", path))?;
        let state = serde_json::from_str(&json).context("Failed to parse trainer state JSON")?;
        Ok(Some(state))
    }
}

/// Outcome of probing a resume directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Weights file to load into the model, if any
    pub weights: Option<PathBuf>,
    /// Whether the trainer may restore its step counters
    pub resume_trainer_state: bool,
}

/// Probe `dir` for the full snapshot first, then the adapter-only one.
///
/// Only the full snapshot keeps trainer-state resumption. Finding neither is
/// not an error: training starts from scratch.
pub fn resolve_resume(dir: &Path, files: &CheckpointSettings) -> ResumePlan {
    let full = dir.join(&files.full_model_file);
    if full.exists() {
        tracing::info!(path = %full.display(), "Restarting from full checkpoint");
        return ResumePlan {
            weights: Some(full),
            resume_trainer_state: true,
        };
    }

    let adapter = dir.join(&files.adapter_file);
    if adapter.exists() {
        tracing::info!(path = %adapter.display(), "Restarting from adapter-only checkpoint, trainer state not resumed");
        ResumePlan {
            weights: Some(adapter),
            resume_trainer_state: false,
        }
    } else {
        tracing::info!(path = %adapter.display(), "Checkpoint not found");
        ResumePlan {
            weights: None,
            resume_trainer_state: false,
        }
    }
}

/// Writes `checkpoint-{step}` directories under the output directory
pub struct CheckpointManager {
    output_dir: PathBuf,
    /// Maximum number of checkpoints to keep (0 keeps everything)
    save_total_limit: usize,
    weights_file: String,
}

impl CheckpointManager {
    pub fn new(output_dir: PathBuf, save_total_limit: usize, weights_file: impl Into<String>) -> Result<Self> {
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

        Ok(Self {
            output_dir,
            save_total_limit,
            weights_file: weights_file.into(),
        })
    }

    pub fn checkpoint_dir(&self, step: usize) -> PathBuf {
        self.output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
    }

    pub fn weights_path(&self, checkpoint: &Path) -> PathBuf {
        checkpoint.join(&self.weights_file)
    }

    /// Save model weights, adapter config and trainer state for `state.global_step`
    pub fn save(&self, model: &LlamaForSequenceClassification, state: &TrainerState) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(state.global_step);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", dir))?;

        model.save_adapter(&dir, &self.weights_file)?;
        state.save(&dir)?;

        tracing::info!(step = state.global_step, dir = %dir.display(), "Saved checkpoint");
        Ok(dir)
    }

    /// Checkpoint directories sorted by step, oldest first
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints = Vec::new();
        if !self.output_dir.exists() {
            return Ok(checkpoints);
        }

        for entry in fs::read_dir(&self.output_dir)
            .with_context(|| format!("Failed to read output directory: {:?}", self.output_dir))?
        {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|s| s.parse::<usize>().ok());
            if let Some(step) = step {
                checkpoints.push((step, path));
            }
        }

        checkpoints.sort_by_key(|(step, _)| *step);
        Ok(checkpoints)
    }

    /// Delete the oldest checkpoints beyond the limit, never the best one
    pub fn rotate(&self, best: Option<&Path>) -> Result<usize> {
        if self.save_total_limit == 0 {
            return Ok(0);
        }
        let checkpoints = self.list_checkpoints()?;
        let newest = checkpoints.last().map(|(_, p)| p.clone());

        // The newest checkpoint always survives next to the best one
        let mut limit = self.save_total_limit;
        if limit == 1 && best.is_some() && best != newest.as_deref() {
            limit = 2;
        }
        if checkpoints.len() <= limit {
            return Ok(0);
        }

        let excess = checkpoints.len() - limit;
        let doomed: Vec<&PathBuf> = checkpoints
            .iter()
            .map(|(_, p)| p)
            .filter(|p| Some(p.as_path()) != best)
            .take(excess)
            .collect();

        for dir in &doomed {
            fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to delete checkpoint directory: {:?}", dir))?;
            tracing::debug!(dir = %dir.display(), "Deleted checkpoint");
        }
        if !doomed.is_empty() {
            tracing::info!(deleted = doomed.len(), kept = limit, "Cleaned up old checkpoints");
        }
        Ok(doomed.len())
    }
}
