// Model loaders

pub mod llama;

pub use llama::{load_from_files, load_model_tokenizer};
