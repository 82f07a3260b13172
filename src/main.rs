// llama-classify - LoRA fine-tuning and inference for Llama sequence classifiers
// Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use llama_classify::classify::{FinetuneOutcome, LlamaClassify};
use llama_classify::config::load_config;
use llama_classify::errors::UserFriendlyError;
use llama_classify::task::{DataSource, EvalRequest, JsonTask};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "llama-classify")]
#[command(about = "LoRA fine-tuning and inference for Llama sequence classifiers", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Train a LoRA adapter on labelled examples
    Finetune {
        /// Task configuration (TOML); defaults to ~/.llama-classify/config.toml
        #[arg(long)]
        config: Option<PathBuf>,
        /// Training data file or directory
        #[arg(long)]
        data: Option<PathBuf>,
        /// Only read the data file for this iteration
        #[arg(long)]
        iteration: Option<usize>,
    },
    /// Classify inputs with the base model plus an optional adapter
    Generate {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Evaluation data file or directory
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long)]
        instruction: Option<String>,
        /// Classify this text instead of a data source
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        iteration: Option<usize>,
        #[arg(long = "test-iteration")]
        test_iteration: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::Finetune {
            config,
            data,
            iteration,
        } => run_finetune(config, data, iteration).await,
        Command::Generate {
            config,
            data,
            instruction,
            input,
            iteration,
            test_iteration,
        } => {
            let request = EvalRequest {
                instruction,
                input,
                source: data.map(DataSource::from_path),
                iteration,
                test_iteration,
            };
            run_generate(config, request).await
        }
    }
}

fn init_tracing() {
    // Default: INFO level, can be overridden with RUST_LOG env var
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Bridge log crate → tracing (hf-hub, ureq)
    tracing_log::LogTracer::init().ok();
}

async fn run_finetune(config: Option<PathBuf>, data: Option<PathBuf>, iteration: Option<usize>) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let data = data
        .or_else(|| config.data.train_path.clone())
        .context("No training data: pass --data or set data.train_path in the config")?;
    let source = DataSource::from_path(data);

    // Training is CPU/GPU bound; keep it off the async workers
    let outcome = tokio::task::spawn_blocking(move || {
        let mut classifier = LlamaClassify::new(JsonTask::new(config));
        classifier.finetune(&source, iteration)
    })
    .await
    .context("Training task panicked")?
    .user_context_with_suggestion(
        "Fine-tuning failed",
        "Check model.base_model, the label list and the data files; run with RUST_LOG=debug for details",
    )?;

    match outcome {
        FinetuneOutcome::EmptyData => println!("Warning! Empty training data, nothing was trained."),
        FinetuneOutcome::Trained(report) => {
            println!(
                "Trained {} steps on {} rows ({} validation), final loss {:.4}",
                report.output.global_step, report.train_rows, report.val_rows, report.output.training_loss
            );
            if let Some(best) = &report.output.best_model_checkpoint {
                println!("Best checkpoint: {}", best.display());
            }
            println!("Adapter saved to {}", report.adapter_dir.display());
        }
    }
    Ok(())
}

async fn run_generate(config: Option<PathBuf>, request: EvalRequest) -> Result<()> {
    let config = load_config(config.as_deref())?;

    let report = tokio::task::spawn_blocking(move || {
        let mut classifier = LlamaClassify::new(JsonTask::new(config));
        classifier.generate(&request)
    })
    .await
    .context("Generation task panicked")?
    .user_context("Generation failed")?;

    match report.accuracy {
        Some(accuracy) => println!(
            "Classified {} items, accuracy {:.2}% ({}/{})",
            report.total,
            accuracy * 100.0,
            report.correct,
            report.labelled
        ),
        None => println!("Classified {} items", report.total),
    }
    if let Some(path) = &report.output_path {
        println!("Predictions written to {}", path.display());
    }
    Ok(())
}
