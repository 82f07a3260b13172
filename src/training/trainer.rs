// Training loop: AdamW over the trainable VarMap with gradient accumulation,
// clipping, periodic evaluation and checkpointing

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

use super::args::TrainingArguments;
use super::checkpoint::{CheckpointManager, LogEntry, TrainerState};
use super::collator::PaddingCollator;
use super::dataset::TokenizedRecord;
use super::sampler::BatchSampler;
use super::schedule::LinearSchedule;
use crate::metrics::{MetricKind, MetricsLogger, TrainingMetric};
use crate::models::LlamaForSequenceClassification;

/// Validation metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

impl EvalMetrics {
    /// Value of `eval_loss` / `eval_accuracy` (prefix optional)
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name.trim_start_matches("eval_") {
            "loss" => Some(self.loss),
            "accuracy" => Some(self.accuracy),
            _ => None,
        }
    }
}

/// Summary of a `train` call
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    pub global_step: usize,
    /// Mean loss over the steps run by this call
    pub training_loss: f64,
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<PathBuf>,
}

pub struct Trainer<'a> {
    model: &'a mut LlamaForSequenceClassification,
    args: TrainingArguments,
    train_data: Vec<TokenizedRecord>,
    eval_data: Option<Vec<TokenizedRecord>>,
    collator: PaddingCollator,
    checkpoints: CheckpointManager,
    metrics: Option<MetricsLogger>,
}

impl<'a> Trainer<'a> {
    pub fn new(
        model: &'a mut LlamaForSequenceClassification,
        args: TrainingArguments,
        train_data: Vec<TokenizedRecord>,
        eval_data: Option<Vec<TokenizedRecord>>,
        collator: PaddingCollator,
        weights_file: &str,
    ) -> Result<Self> {
        if train_data.is_empty() {
            bail!("Trainer needs at least one training record");
        }
        let checkpoints =
            CheckpointManager::new(args.output_dir.clone(), args.save_total_limit, weights_file)?;
        args.save(&args.output_dir)?;
        let metrics = match &args.report_to {
            Some(path) => Some(MetricsLogger::new(path)?),
            None => None,
        };

        Ok(Self {
            model,
            args,
            train_data,
            eval_data: eval_data.filter(|d| !d.is_empty()),
            collator,
            checkpoints,
            metrics,
        })
    }

    /// Run the configured epochs. With `resume_from_checkpoint` the step and
    /// epoch counters come from its `trainer_state.json`; already-run batches
    /// of the interrupted epoch are skipped. Optimizer moments start fresh.
    pub fn train(&mut self, resume_from_checkpoint: Option<&Path>) -> Result<TrainOutput> {
        let device = self.model.device().clone();
        let vars = self.model.trainable_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: self.args.learning_rate,
                weight_decay: self.args.weight_decay,
                ..ParamsAdamW::default()
            },
        )?;

        let sampler = BatchSampler::new(
            self.args.per_device_train_batch_size,
            self.args.group_by_length,
            self.args.seed,
        );
        let lengths: Vec<usize> = self.train_data.iter().map(TokenizedRecord::len).collect();
        let accumulation = self.args.gradient_accumulation_steps.max(1);
        let updates_per_epoch = sampler.num_batches(lengths.len()).div_ceil(accumulation).max(1);
        let max_steps = updates_per_epoch * self.args.num_train_epochs;
        let schedule = LinearSchedule::new(self.args.learning_rate, self.args.warmup_steps, max_steps);
        let save_steps = self.args.effective_save_steps();
        let eval_steps = self.args.effective_eval_steps();

        let mut state = TrainerState::default();
        if let Some(dir) = resume_from_checkpoint {
            match TrainerState::load(dir)? {
                Some(saved) => {
                    tracing::info!(dir = %dir.display(), global_step = saved.global_step, "Resuming trainer state");
                    state = saved;
                }
                None => tracing::warn!(dir = %dir.display(), "No trainer state in checkpoint, starting at step 0"),
            }
        }
        let start_epoch = state.global_step / updates_per_epoch;
        let skip_updates = state.global_step % updates_per_epoch;

        tracing::info!(
            examples = self.train_data.len(),
            eval_examples = self.eval_data.as_ref().map_or(0, Vec::len),
            epochs = self.args.num_train_epochs,
            batch_size = self.args.per_device_train_batch_size,
            accumulation,
            max_steps,
            trainable_parameters = self.model.num_trainable_parameters(),
            "Starting training"
        );

        let progress = ProgressBar::new(max_steps as u64);
        progress.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] [{bar:40}] {pos}/{len} steps {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        progress.set_position(state.global_step.min(max_steps) as u64);

        let mut run_loss = 0.0;
        let mut run_steps = 0usize;
        let mut window_loss = 0.0;
        let mut window_steps = 0usize;

        for epoch in start_epoch..self.args.num_train_epochs {
            let batches = sampler.epoch_batches(&lengths, epoch);
            for (update, chunk) in batches.chunks(accumulation).enumerate() {
                if epoch == start_epoch && update < skip_updates {
                    continue;
                }

                let lr = schedule.lr(state.global_step);
                let (loss, grad_norm) = self.training_step(chunk, &vars, &mut optimizer, lr, &device)?;
                state.global_step += 1;
                state.epoch = state.global_step as f64 / updates_per_epoch as f64;
                run_loss += loss;
                run_steps += 1;
                window_loss += loss;
                window_steps += 1;
                progress.inc(1);
                progress.set_message(format!("loss {:.4}", loss));

                let step = state.global_step;
                if self.args.logging_steps > 0 && step % self.args.logging_steps == 0 {
                    let mean = window_loss / window_steps as f64;
                    tracing::info!(step, epoch = state.epoch, loss = mean, learning_rate = lr, grad_norm, "Training");
                    let mut entry = LogEntry::new(step, state.epoch);
                    entry.loss = Some(mean);
                    entry.learning_rate = Some(lr);
                    entry.grad_norm = Some(grad_norm);
                    state.log_history.push(entry);
                    let epoch_f = state.epoch;
                    self.track(|run| {
                        TrainingMetric::new(run, MetricKind::Train, step, epoch_f)
                            .loss(mean)
                            .learning_rate(lr)
                            .grad_norm(grad_norm)
                    });
                    window_loss = 0.0;
                    window_steps = 0;
                }

                let step_eval = match eval_steps {
                    Some(every) if step % every == 0 => self.evaluate()?,
                    _ => None,
                };
                if let Some(metrics) = step_eval {
                    tracing::info!(step, eval_loss = metrics.loss, eval_accuracy = metrics.accuracy, "Evaluation");
                    let mut entry = LogEntry::new(step, state.epoch);
                    entry.eval_loss = Some(metrics.loss);
                    entry.eval_accuracy = Some(metrics.accuracy);
                    state.log_history.push(entry);
                    let epoch_f = state.epoch;
                    self.track(|run| {
                        TrainingMetric::new(run, MetricKind::Eval, step, epoch_f)
                            .loss(metrics.loss)
                            .accuracy(metrics.accuracy)
                    });
                }

                if step % save_steps == 0 {
                    self.save_checkpoint(&mut state, step_eval)?;
                }
            }
        }
        progress.finish_and_clear();

        if self.args.load_best_model_at_end {
            if let Some(best) = &state.best_model_checkpoint {
                let weights = self.checkpoints.weights_path(best);
                self.model
                    .load_trainable(&weights)
                    .context("Failed to load best checkpoint at end of training")?;
                tracing::info!(
                    checkpoint = %best.display(),
                    best_metric = ?state.best_metric,
                    "Loaded best model"
                );
            }
        }

        let training_loss = if run_steps > 0 { run_loss / run_steps as f64 } else { 0.0 };
        tracing::info!(global_step = state.global_step, training_loss, "Training finished");
        let (step, epoch_f) = (state.global_step, state.epoch);
        self.track(|run| TrainingMetric::new(run, MetricKind::Summary, step, epoch_f).loss(training_loss));

        Ok(TrainOutput {
            global_step: state.global_step,
            training_loss,
            best_metric: state.best_metric,
            best_model_checkpoint: state.best_model_checkpoint,
        })
    }

    /// Forward and backward over one accumulation chunk, then one optimizer step.
    /// Returns the chunk's mean loss and the pre-clipping gradient norm.
    fn training_step(
        &self,
        chunk: &[Vec<usize>],
        vars: &[Var],
        optimizer: &mut AdamW,
        lr: f64,
        device: &Device,
    ) -> Result<(f64, f64)> {
        let total_rows: usize = chunk.iter().map(Vec::len).sum();
        let mut summed: Vec<Option<Tensor>> = vec![None; vars.len()];
        let mut last_store = None;
        let mut chunk_loss = 0.0;

        for indices in chunk {
            let records: Vec<&TokenizedRecord> = indices.iter().map(|&i| &self.train_data[i]).collect();
            let batch = self.collator.collate(&records, device)?;
            let logits = self.model.forward(&batch.input_ids, &batch.lengths, true)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;

            // Micro-batches contribute in proportion to their rows
            let weight = batch.size() as f64 / total_rows as f64;
            let grads = loss.affine(weight, 0.0)?.backward()?;
            chunk_loss += loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64 * weight;

            for (slot, var) in summed.iter_mut().zip(vars) {
                if let Some(grad) = grads.get(var.as_tensor()) {
                    *slot = Some(match slot.take() {
                        Some(prev) => (prev + grad)?,
                        None => grad.clone(),
                    });
                }
            }
            last_store = Some(grads);
        }

        let mut store = last_store.context("empty gradient accumulation chunk")?;
        let grad_norm = clip_grad_norm(&mut summed, self.args.max_grad_norm)?;
        for (slot, var) in summed.into_iter().zip(vars) {
            if let Some(grad) = slot {
                store.insert(var.as_tensor(), grad);
            }
        }

        optimizer.set_learning_rate(lr);
        optimizer.step(&store)?;
        Ok((chunk_loss, grad_norm))
    }

    /// Mean loss and accuracy over the validation set, `None` without one
    pub fn evaluate(&self) -> Result<Option<EvalMetrics>> {
        let Some(eval) = &self.eval_data else {
            return Ok(None);
        };
        let device = self.model.device();
        let batch_size = self.args.per_device_train_batch_size.max(1);

        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        for chunk in eval.chunks(batch_size) {
            let records: Vec<&TokenizedRecord> = chunk.iter().collect();
            let batch = self.collator.collate(&records, device)?;
            let logits = self
                .model
                .forward(&batch.input_ids, &batch.lengths, false)?
                .detach();
            let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
            loss_sum += loss.to_scalar::<f32>()? as f64 * chunk.len() as f64;

            let predicted: Vec<u32> = logits.argmax(D::Minus1)?.to_vec1()?;
            correct += predicted
                .iter()
                .zip(chunk)
                .filter(|(p, r)| **p == r.label)
                .count();
        }

        Ok(Some(EvalMetrics {
            loss: loss_sum / eval.len() as f64,
            accuracy: correct as f64 / eval.len() as f64,
        }))
    }

    fn save_checkpoint(&mut self, state: &mut TrainerState, eval: Option<EvalMetrics>) -> Result<()> {
        let dir = self.checkpoints.checkpoint_dir(state.global_step);
        if let Some(metrics) = eval {
            let Some(value) = metrics.metric(&self.args.metric_for_best_model) else {
                bail!("Unknown metric_for_best_model '{}'", self.args.metric_for_best_model);
            };
            if self.args.is_better(value, state.best_metric) {
                state.best_metric = Some(value);
                state.best_model_checkpoint = Some(dir.clone());
            }
        }
        self.checkpoints.save(&*self.model, state)?;
        self.checkpoints.rotate(state.best_model_checkpoint.as_deref())?;
        Ok(())
    }

    fn track<F>(&mut self, build: F)
    where
        F: FnOnce(&str) -> TrainingMetric,
    {
        if let Some(logger) = &mut self.metrics {
            let metric = build(logger.run_id());
            if let Err(e) = logger.log(&metric) {
                tracing::warn!("Failed to record metric: {}", e);
            }
        }
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`; returns the
/// norm before scaling. A non-positive `max_norm` disables clipping.
pub fn clip_grad_norm(grads: &mut [Option<Tensor>], max_norm: f64) -> Result<f64> {
    let mut total = 0.0f64;
    for grad in grads.iter().flatten() {
        total += grad.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
    }
    let norm = total.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for grad in grads.iter_mut().flatten() {
            *grad = grad.affine(scale, 0.0)?;
        }
    }
    Ok(norm)
}
