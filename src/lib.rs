// llama-classify - LoRA fine-tuning and inference for Llama sequence classifiers
// Library exports

pub mod classify; // Fine-tuning orchestrator, evaluator, generation driver
pub mod config;
pub mod errors;
pub mod metrics; // Opt-in JSONL experiment tracking
pub mod models; // Llama classifier, LoRA, tokenizer, weights resolution
pub mod task; // Collaborator hooks and the JSON file task
pub mod training; // Dataset split, schedule, checkpoints, training loop
