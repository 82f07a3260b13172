// Error types and user-friendly error messages
//
// Domain failures that callers may want to match on are `ClassifyError`.
// Everything else travels as `anyhow::Error` with context attached, and the
// helpers below turn the common failures into actionable messages.

use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;

/// Failures raised by the classification pipeline itself
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// An example's `output` is not part of the configured label vocabulary
    #[error("label '{label}' is not in the label vocabulary {labels:?}")]
    LabelNotFound { label: String, labels: Vec<String> },

    /// The model predicted an index outside the label vocabulary
    #[error("predicted class index {index} is out of range for {num_labels} labels")]
    PredictionOutOfRange { index: usize, num_labels: usize },

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The tokenizer rejected an input or could not be loaded
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// A file the model directory must contain is missing
    #[error("required model file not found: {}", .0.display())]
    MissingModelFile(PathBuf),

    /// Validation split asks for more rows than the dataset has
    #[error("validation set size {requested} leaves no training rows out of {available}")]
    SplitTooLarge { requested: usize, available: usize },
}

/// Wrap an error with user-friendly context
pub trait UserFriendlyError {
    /// Add user-friendly context to this error
    fn user_context(self, message: &str) -> Self;

    /// Add user-friendly context with a suggestion
    fn user_context_with_suggestion(self, problem: &str, suggestion: &str) -> Self;
}

impl<T> UserFriendlyError for Result<T> {
    fn user_context(self, message: &str) -> Self {
        self.with_context(|| message.to_string())
    }

    fn user_context_with_suggestion(self, problem: &str, suggestion: &str) -> Self {
        self.with_context(|| {
            format!("{}\n\n\x1b[1;33mSuggestion:\x1b[0m {}", problem, suggestion)
        })
    }
}

/// Format a model loading error with helpful suggestions
pub fn model_loading_error(model_name: &str, error: impl fmt::Display) -> String {
    format!(
        "Failed to load model '{}'\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Wrong model identifier or local path\n\
        • Missing config.json, tokenizer.json or safetensors weights\n\
        • Gated repository without a HuggingFace token\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check the directory contents:\n\
           \x1b[36mls {}\x1b[0m\n\n\
        2. Check the HuggingFace cache:\n\
           \x1b[36mls ~/.cache/huggingface/hub/\x1b[0m",
        model_name, error, model_name
    )
}

/// Format a config parse error with helpful suggestions
pub fn config_parse_error(path: &str, error: impl fmt::Display) -> String {
    format!(
        "Failed to parse config file {}\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;32mCommon mistakes:\x1b[0m\n\
        • Missing quotes around strings\n\
        • `labels` not given as an array of strings\n\
        • Unknown section name",
        path, error
    )
}
