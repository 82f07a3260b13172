// Metrics module
// Opt-in experiment tracking: training and evaluation records as JSONL

mod logger;
mod types;

pub use logger::MetricsLogger;
pub use types::{MetricKind, TrainingMetric};
