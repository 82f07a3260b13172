// Llama sequence classification task
//
// `LlamaClassify` wires a task's collaborator hooks to the model, the
// dataset pipeline and the trainer: `finetune` trains a LoRA adapter,
// `generate` labels a batch of inputs with a trained one.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use std::path::{Path, PathBuf};

use crate::config::TaskConfig;
use crate::errors::ClassifyError;
use crate::models::{
    activation_dtype, load_model_tokenizer, LlamaForSequenceClassification, LoadOptions, TextTokenizer,
};
use crate::task::{DataSource, EvalReport, EvalRequest, Example, LlmTask};
use crate::training::{
    resolve_resume, split_train_data, tokenize_example, PaddingCollator, SplitData, StepPlan,
    TokenizedRecord, TrainOutput, Trainer, TrainingArguments, SPLIT_SEED,
};

/// Result of a fine-tuning run
#[derive(Debug)]
pub enum FinetuneOutcome {
    /// The task returned no training data; nothing was trained
    EmptyData,
    Trained(FinetuneReport),
}

#[derive(Debug)]
pub struct FinetuneReport {
    pub plan: StepPlan,
    pub train_rows: usize,
    pub val_rows: usize,
    /// Checkpoint whose weights seeded the run
    pub resumed_from: Option<PathBuf>,
    pub output: TrainOutput,
    /// Where the final adapter was written
    pub adapter_dir: PathBuf,
}

pub struct LlamaClassify<T: LlmTask> {
    task: T,
    tokenizer: Option<TextTokenizer>,
}

impl<T: LlmTask> LlamaClassify<T> {
    pub fn new(task: T) -> Self {
        Self {
            task,
            tokenizer: None,
        }
    }

    fn config(&self) -> &TaskConfig {
        self.task.config()
    }

    fn tokenizer(&self) -> Result<&TextTokenizer, ClassifyError> {
        self.tokenizer
            .as_ref()
            .ok_or_else(|| ClassifyError::Tokenizer("tokenizer not loaded; load the model first".to_string()))
    }

    /// Build the classifier and its tokenizer for the configured base model
    pub fn get_model_tokenizer(
        &self,
        device: &Device,
        options: LoadOptions,
    ) -> Result<(LlamaForSequenceClassification, TextTokenizer)> {
        let config = self.config();
        load_model_tokenizer(&config.model, config.labels.len(), device, options)
    }

    /// One example to token ids plus its label index
    pub fn tokenize_prompt(&self, example: &Example) -> Result<TokenizedRecord, ClassifyError> {
        tokenize_example(self.tokenizer()?, &self.config().labels, example)
    }

    /// Seeded split into tokenized train and validation partitions
    pub fn split_train_data(&self, data: Vec<Example>) -> Result<SplitData, ClassifyError> {
        let tokenizer = self.tokenizer()?;
        let labels = &self.config().labels;
        split_train_data(
            data,
            self.config().training.val_set_size,
            SPLIT_SEED,
            |example| tokenize_example(tokenizer, labels, example),
        )
    }

    /// Train a LoRA adapter on the task's data and save it to the output directory
    pub fn finetune(&mut self, source: &DataSource, iteration: Option<usize>) -> Result<FinetuneOutcome> {
        let device = self.task.auto_device()?;
        let config = self.config().clone();
        let training = &config.training;

        let options = LoadOptions {
            dtype: activation_dtype(&device, training.is_fp16),
            low_bit: config.model.load_8bit,
        };
        let (mut model, tokenizer) = self.get_model_tokenizer(&device, options)?;
        let pad_token_id = tokenizer.pad_token_id();
        self.tokenizer = Some(tokenizer);
        if config.model.load_8bit {
            model.prepare_for_low_bit_training()?;
        }

        let lora = self.task.load_adapter_config(&mut model)?;
        tracing::info!(targets = ?lora.target_modules, rank = lora.rank, "LoRA adapter configured");

        let data = self.task.load_train_data(source, iteration)?;
        if data.is_empty() {
            tracing::warn!(source = %source.path().display(), iteration = ?iteration, "Empty training data, nothing to train");
            return Ok(FinetuneOutcome::EmptyData);
        }

        let split = self.split_train_data(data)?;
        let train_rows = split.train.len();
        let val_rows = split.val.as_ref().map_or(0, Vec::len);

        let mut resume_dir = training.resume_from_checkpoint.clone();
        let mut resumed_from = None;
        if let Some(dir) = &training.resume_from_checkpoint {
            let plan = resolve_resume(dir, &config.checkpoint);
            if let Some(weights) = &plan.weights {
                model.load_trainable(weights)?;
                resumed_from = Some(dir.clone());
            }
            if !plan.resume_trainer_state {
                resume_dir = None;
            }
        }

        let plan = StepPlan::compute(
            training.per_gpu_train_batch_size,
            training.gradient_accumulation_steps,
            config.distributed.world_size,
            config.ddp(),
            train_rows,
        );
        tracing::info!(
            effective_batch_size = plan.effective_batch_size,
            total_optim_steps = plan.total_optim_steps,
            save_steps = plan.save_steps,
            warmup_steps = plan.warmup_steps,
            "Computed step schedule"
        );
        let args = TrainingArguments::from_config(&config, &plan, split.val.is_some());

        model.set_use_cache(false);
        if training.compile && !cfg!(windows) {
            model.compile()?;
        }

        let output = {
            let mut trainer = Trainer::new(
                &mut model,
                args,
                split.train,
                split.val,
                PaddingCollator::new(pad_token_id),
                &config.checkpoint.full_model_file,
            )?;
            trainer.train(resume_dir.as_deref())?
        };

        model
            .save_adapter(&training.output_dir, &config.checkpoint.adapter_file)
            .context("Failed to save final adapter")?;

        Ok(FinetuneOutcome::Trained(FinetuneReport {
            plan,
            train_rows,
            val_rows,
            resumed_from,
            output,
            adapter_dir: training.output_dir.clone(),
        }))
    }

    /// Predicted label for one raw input
    pub fn evaluate(&self, model: &LlamaForSequenceClassification, input: &str) -> Result<String> {
        let input_ids = self.tokenizer()?.encode(input)?;
        let index = model.predict(&input_ids)?;
        let labels = &self.config().labels;
        labels.get(index).cloned().ok_or_else(|| {
            ClassifyError::PredictionOutOfRange {
                index,
                num_labels: labels.len(),
            }
            .into()
        })
    }

    /// Label every item the task supplies and hand the results back to it
    pub fn generate(&mut self, request: &EvalRequest) -> Result<EvalReport> {
        let device = self.task.auto_device()?;
        let config = self.config().clone();

        let options = LoadOptions {
            dtype: DType::F32,
            low_bit: config.model.load_8bit,
        };
        let (mut model, tokenizer) = self.get_model_tokenizer(&device, options)?;
        self.tokenizer = Some(tokenizer);

        if config.has_adapter_weights() {
            let dir = Path::new(config.model.adapter_weights.trim());
            model
                .load_adapter(dir, &config.checkpoint.adapter_file)
                .with_context(|| format!("Failed to load adapter from {}", dir.display()))?;
        } else {
            tracing::info!("No adapter weights configured, using the base model");
        }

        if !config.model.load_8bit {
            model.to_dtype(activation_dtype(&device, true))?;
        }

        let mut items = self.task.get_eval_input(request)?;
        tracing::info!(items = items.len(), "Classifying evaluation items");
        for item in items.iter_mut() {
            let label = self.evaluate(&model, &item.input)?;
            item.ac_output = Some(label);
        }

        self.task.eval_output(&items, request)
    }
}
