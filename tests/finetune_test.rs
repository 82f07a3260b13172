// End-to-end fine-tuning on a tiny random Llama (CPU)

mod common;

use llama_classify::classify::{FinetuneOutcome, LlamaClassify};
use llama_classify::config::ValSetSize;
use llama_classify::errors::ClassifyError;
use llama_classify::task::{DataSource, JsonTask};
use llama_classify::training::TrainerState;
use std::fs;
use tempfile::TempDir;

use common::{examples, tiny_config, write_jsonl, write_tiny_model};

struct Fixture {
    _root: TempDir,
    model_dir: std::path::PathBuf,
    data: std::path::PathBuf,
    output_dir: std::path::PathBuf,
}

fn fixture(rows: usize) -> Fixture {
    let root = TempDir::new().unwrap();
    let model_dir = root.path().join("model");
    write_tiny_model(&model_dir);
    let data = root.path().join("train.jsonl");
    write_jsonl(&data, &examples(rows));
    let output_dir = root.path().join("out");
    Fixture {
        model_dir,
        data,
        output_dir,
        _root: root,
    }
}

#[test]
fn test_finetune_trains_and_saves_adapter() {
    let fx = fixture(20);
    let mut config = tiny_config(&fx.model_dir, &fx.output_dir);
    config.training.val_set_size = ValSetSize::Count(4);
    config.tracking.disable_tracking = false;

    let mut classifier = LlamaClassify::new(JsonTask::new(config));
    let outcome = classifier.finetune(&DataSource::from_path(&fx.data), None).unwrap();

    let FinetuneOutcome::Trained(report) = outcome else {
        panic!("expected a training run");
    };
    assert_eq!(report.train_rows, 16);
    assert_eq!(report.val_rows, 4);
    assert_eq!(report.plan.effective_batch_size, 4);
    assert_eq!(report.plan.total_optim_steps, 4);
    assert_eq!(report.plan.save_steps, 0);
    // 8 batches per epoch, 2 per update, 2 epochs
    assert_eq!(report.output.global_step, 8);
    assert!(report.output.training_loss.is_finite());
    assert!(report.output.best_metric.is_some());
    assert!(report.resumed_from.is_none());

    assert!(fx.output_dir.join("adapter_model.safetensors").exists());
    assert!(fx.output_dir.join("adapter_config.json").exists());
    assert!(fx.output_dir.join("metrics.jsonl").exists());
    assert!(fx.output_dir.join("training_args.json").exists());

    let best = report.output.best_model_checkpoint.unwrap();
    assert!(best.join("model.safetensors").exists());
    let state = TrainerState::load(&fx.output_dir.join("checkpoint-8")).unwrap().unwrap();
    assert_eq!(state.global_step, 8);
    assert!(state.log_history.iter().any(|e| e.eval_loss.is_some()));
}

#[test]
fn test_best_checkpoint_by_accuracy() {
    let fx = fixture(12);
    let mut config = tiny_config(&fx.model_dir, &fx.output_dir);
    config.training.val_set_size = ValSetSize::Count(4);
    config.training.epochs = 1;
    config.training.metric_for_best_model = "eval_accuracy".to_string();

    let outcome = LlamaClassify::new(JsonTask::new(config))
        .finetune(&DataSource::from_path(&fx.data), None)
        .unwrap();
    let FinetuneOutcome::Trained(report) = outcome else {
        panic!("expected a training run");
    };
    let best = report.output.best_metric.unwrap();
    assert!((0.0..=1.0).contains(&best));

    let state = TrainerState::load(&fx.output_dir.join("checkpoint-2")).unwrap().unwrap();
    let top = state
        .log_history
        .iter()
        .filter_map(|e| e.eval_accuracy)
        .fold(f64::MIN, f64::max);
    assert_eq!(best, top);
}

#[test]
fn test_empty_data_returns_without_training() {
    let fx = fixture(0);
    let config = tiny_config(&fx.model_dir, &fx.output_dir);

    let mut classifier = LlamaClassify::new(JsonTask::new(config));
    let outcome = classifier.finetune(&DataSource::from_path(&fx.data), None).unwrap();

    assert!(matches!(outcome, FinetuneOutcome::EmptyData));
    assert!(!fx.output_dir.join("adapter_model.safetensors").exists());
}

#[test]
fn test_unknown_label_is_fatal() {
    let fx = fixture(6);
    let mut rows = examples(6);
    rows.push(serde_json::json!({ "input": "fine film", "output": "neutral" }));
    write_jsonl(&fx.data, &rows);

    let config = tiny_config(&fx.model_dir, &fx.output_dir);
    let mut classifier = LlamaClassify::new(JsonTask::new(config));
    let err = classifier.finetune(&DataSource::from_path(&fx.data), None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ClassifyError>(),
        Some(ClassifyError::LabelNotFound { .. })
    ));
}

#[test]
fn test_invalid_base_model_is_fatal() {
    let fx = fixture(4);
    let config = tiny_config(&fx.output_dir.join("missing-model"), &fx.output_dir);
    let mut classifier = LlamaClassify::new(JsonTask::new(config));
    assert!(classifier.finetune(&DataSource::from_path(&fx.data), None).is_err());
}

#[test]
fn test_resume_from_full_checkpoint_continues_step_count() {
    let fx = fixture(16);
    let first = tiny_config(&fx.model_dir, &fx.output_dir);
    LlamaClassify::new(JsonTask::new(first))
        .finetune(&DataSource::from_path(&fx.data), None)
        .unwrap();

    // 16 rows: 4 updates per epoch, checkpoint-4 closes the first epoch
    let checkpoint = fx.output_dir.join("checkpoint-4");
    assert!(checkpoint.join("model.safetensors").exists());

    let resumed_out = fx.output_dir.with_file_name("resumed");
    let mut config = tiny_config(&fx.model_dir, &resumed_out);
    config.training.resume_from_checkpoint = Some(checkpoint.clone());

    let outcome = LlamaClassify::new(JsonTask::new(config))
        .finetune(&DataSource::from_path(&fx.data), None)
        .unwrap();
    let FinetuneOutcome::Trained(report) = outcome else {
        panic!("expected a training run");
    };
    assert_eq!(report.resumed_from, Some(checkpoint));
    assert_eq!(report.output.global_step, 8);
    // only the second epoch ran
    assert!(!resumed_out.join("checkpoint-4").exists());
    assert!(resumed_out.join("checkpoint-5").exists());
}

#[test]
fn test_adapter_only_checkpoint_restarts_trainer_state() {
    let fx = fixture(16);
    let first = tiny_config(&fx.model_dir, &fx.output_dir);
    LlamaClassify::new(JsonTask::new(first))
        .finetune(&DataSource::from_path(&fx.data), None)
        .unwrap();
    assert!(!fx.output_dir.join("model.safetensors").exists());

    let resumed_out = fx.output_dir.with_file_name("resumed");
    let mut config = tiny_config(&fx.model_dir, &resumed_out);
    config.training.resume_from_checkpoint = Some(fx.output_dir.clone());

    let outcome = LlamaClassify::new(JsonTask::new(config))
        .finetune(&DataSource::from_path(&fx.data), None)
        .unwrap();
    let FinetuneOutcome::Trained(report) = outcome else {
        panic!("expected a training run");
    };
    // weights were loaded, but counting restarts from zero
    assert_eq!(report.resumed_from, Some(fx.output_dir.clone()));
    assert_eq!(report.output.global_step, 8);
    assert!(resumed_out.join("checkpoint-1").exists());
}

#[test]
fn test_missing_checkpoint_trains_from_scratch() {
    let fx = fixture(8);
    let mut config = tiny_config(&fx.model_dir, &fx.output_dir);
    config.training.resume_from_checkpoint = Some(fx.output_dir.join("nowhere"));
    config.training.epochs = 1;

    let outcome = LlamaClassify::new(JsonTask::new(config))
        .finetune(&DataSource::from_path(&fx.data), None)
        .unwrap();
    let FinetuneOutcome::Trained(report) = outcome else {
        panic!("expected a training run");
    };
    assert!(report.resumed_from.is_none());
    assert_eq!(report.output.global_step, 2);
}

#[test]
fn test_low_bit_training_with_llama2_targets() {
    let fx = fixture(8);
    let mut config = tiny_config(&fx.model_dir, &fx.output_dir);
    config.model.load_8bit = true;
    config.model.model_type = llama_classify::config::ModelFamily::Llama2;
    config.training.epochs = 1;
    config.training.group_by_length = true;

    let outcome = LlamaClassify::new(JsonTask::new(config))
        .finetune(&DataSource::from_path(&fx.data), None)
        .unwrap();
    assert!(matches!(outcome, FinetuneOutcome::Trained(_)));

    let adapter = fs::read_to_string(fx.output_dir.join("adapter_config.json")).unwrap();
    assert!(adapter.contains("gate_proj"));
}
