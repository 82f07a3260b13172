// Training module - dataset preparation, step arithmetic, checkpoints and the training loop

pub mod args;
pub mod checkpoint;
pub mod collator;
pub mod dataset;
pub mod sampler;
pub mod schedule;
pub mod trainer;

pub use args::{IntervalStrategy, TrainingArguments, SAVE_TOTAL_LIMIT, TRAINING_ARGS_FILE};
pub use checkpoint::{resolve_resume, CheckpointManager, LogEntry, ResumePlan, TrainerState};
pub use collator::{Batch, PaddingCollator};
pub use dataset::{label_index, split_train_data, tokenize_example, SplitData, TokenizedRecord, SPLIT_SEED};
pub use sampler::BatchSampler;
pub use schedule::{LinearSchedule, StepPlan};
pub use trainer::{EvalMetrics, TrainOutput, Trainer};
