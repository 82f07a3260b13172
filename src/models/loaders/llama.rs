// Llama Loader - classification model and tokenizer from a model directory
// Loads Llama / Llama 2 checkpoints on any backend (Metal, CPU, CUDA)

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::VarBuilder;

use crate::config::ModelSettings;
use crate::errors::model_loading_error;
use crate::models::common::device_info;
use crate::models::download::{ModelDownloader, ModelFiles};
use crate::models::llama_classifier::{LlamaConfig, LlamaForSequenceClassification, LoadOptions};
use crate::models::tokenizer::TextTokenizer;

/// Build the classifier and its tokenizer for `settings.base_model`
pub fn load_model_tokenizer(
    settings: &ModelSettings,
    num_labels: usize,
    device: &Device,
    options: LoadOptions,
) -> Result<(LlamaForSequenceClassification, TextTokenizer)> {
    let downloader = match &settings.cache_dir {
        Some(dir) => ModelDownloader::with_cache_dir(dir.clone())?,
        None => ModelDownloader::new(),
    };
    let files = downloader
        .revision(settings.revision.clone())
        .resolve(&settings.base_model)
        .with_context(|| model_loading_error(&settings.base_model, "could not resolve config, tokenizer or weights"))?;

    load_from_files(&files, settings, num_labels, device, options)
}

/// Build from already-resolved files
pub fn load_from_files(
    files: &ModelFiles,
    settings: &ModelSettings,
    num_labels: usize,
    device: &Device,
    options: LoadOptions,
) -> Result<(LlamaForSequenceClassification, TextTokenizer)> {
    tracing::info!(
        model = %settings.base_model,
        device = device_info(device),
        dtype = ?options.dtype,
        low_bit = options.low_bit,
        "Loading Llama classifier"
    );

    let config = LlamaConfig::from_file(&files.config)?;

    // Safety: safetensors files are memory-mapped and must not change while loaded
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, options.dtype, device) }
        .with_context(|| format!("Failed to load weights for {}", settings.base_model))?;

    let model = LlamaForSequenceClassification::load(vb, config, num_labels, options)
        .with_context(|| format!("Failed to build classifier for {}", settings.base_model))?;

    let tokenizer = TextTokenizer::from_dir(
        files.tokenizer_dir()?,
        settings.add_eos_token,
        settings.max_length,
    )?;

    Ok((model, tokenizer))
}
