// File-backed task: examples and eval items from JSON / JSONL files,
// annotated predictions written back as JSONL

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{DataSource, EvalItem, EvalReport, EvalRequest, Example, LlmTask};
use crate::config::TaskConfig;

pub struct JsonTask {
    config: TaskConfig,
}

impl JsonTask {
    pub fn new(config: TaskConfig) -> Self {
        Self { config }
    }

    /// Directory receiving annotated eval output
    fn eval_output_dir(&self) -> &Path {
        self.config
            .data
            .eval_output_dir
            .as_deref()
            .unwrap_or(&self.config.training.output_dir)
    }
}

fn is_data_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("jsonl")
    )
}

/// Whether `path` belongs to `iteration`: stem `N` or ending in `_N` / `-N`
fn matches_iteration(path: &Path, iteration: usize) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let tag = iteration.to_string();
    stem == tag
        || stem
            .rsplit(|c| c == '_' || c == '-')
            .next()
            .is_some_and(|last| last == tag && stem.len() > tag.len())
}

/// Data files a source expands to, in name order
fn data_files(source: &DataSource, iteration: Option<usize>) -> Result<Vec<PathBuf>> {
    match source {
        DataSource::File(path) => {
            if !path.exists() {
                bail!("Data file not found: {}", path.display());
            }
            Ok(vec![path.clone()])
        }
        DataSource::Directory(dir) => {
            let mut files = Vec::new();
            for entry in fs::read_dir(dir)
                .with_context(|| format!("Failed to read data directory {}", dir.display()))?
            {
                let path = entry?.path();
                if path.is_file() && is_data_file(&path) {
                    files.push(path);
                }
            }
            files.sort();
            if let Some(iteration) = iteration {
                files.retain(|p| matches_iteration(p, iteration));
                if files.is_empty() {
                    tracing::warn!(dir = %dir.display(), iteration, "No data files for iteration");
                }
            }
            Ok(files)
        }
    }
}

/// `.jsonl`: one object per non-blank line; anything else: a JSON array
fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("{}:{}: invalid record", path.display(), i + 1))
            })
            .collect()
    } else if raw.trim().is_empty() {
        Ok(Vec::new())
    } else {
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

fn read_all<T: DeserializeOwned>(source: &DataSource, iteration: Option<usize>) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for file in data_files(source, iteration)? {
        let mut batch = read_records(&file)?;
        tracing::debug!(file = %file.display(), rows = batch.len(), "Read data file");
        records.append(&mut batch);
    }
    Ok(records)
}

impl LlmTask for JsonTask {
    fn config(&self) -> &TaskConfig {
        &self.config
    }

    fn load_train_data(&self, source: &DataSource, iteration: Option<usize>) -> Result<Vec<Example>> {
        let examples: Vec<Example> = read_all(source, iteration)?;
        tracing::info!(
            source = %source.path().display(),
            iteration = ?iteration,
            rows = examples.len(),
            "Loaded training data"
        );
        Ok(examples)
    }

    fn get_eval_input(&self, request: &EvalRequest) -> Result<Vec<EvalItem>> {
        if let Some(input) = &request.input {
            let instruction = request.instruction.clone().unwrap_or_default();
            return Ok(vec![EvalItem::new(instruction, input.clone())]);
        }

        let source = match (&request.source, &self.config.data.eval_path) {
            (Some(source), _) => source.clone(),
            (None, Some(path)) => DataSource::from_path(path),
            (None, None) => bail!("No evaluation input: pass an input text or a data source"),
        };
        let mut items: Vec<EvalItem> = read_all(&source, request.iteration)?;
        if let Some(instruction) = &request.instruction {
            for item in items.iter_mut().filter(|i| i.instruction.is_empty()) {
                item.instruction = instruction.clone();
            }
        }
        Ok(items)
    }

    fn eval_output(&self, items: &[EvalItem], request: &EvalRequest) -> Result<EvalReport> {
        let dir = self.eval_output_dir();
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let tag = |n: Option<usize>| n.map_or_else(|| "all".to_string(), |n| n.to_string());
        let path = dir.join(format!(
            "eval-{}-{}.jsonl",
            tag(request.iteration),
            tag(request.test_iteration)
        ));

        let mut file = fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for item in items {
            let line = serde_json::to_string(item).context("Failed to serialize eval item")?;
            writeln!(file, "{}", line).with_context(|| format!("Failed to write {}", path.display()))?;
        }

        let report = EvalReport::from_items(items, Some(path));
        match report.accuracy {
            Some(accuracy) => tracing::info!(
                total = report.total,
                labelled = report.labelled,
                correct = report.correct,
                accuracy,
                "Evaluation finished"
            ),
            None => tracing::info!(total = report.total, "Evaluation finished (no gold labels)"),
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(output_dir: &Path) -> JsonTask {
        let mut config = TaskConfig::new("models/tiny", vec!["positive".into(), "negative".into()]);
        config.training.output_dir = output_dir.to_path_buf();
        JsonTask::new(config)
    }

    #[test]
    fn test_reads_jsonl_and_json_array() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("train.jsonl"),
            "{\"instruction\": \"\", \"input\": \"a\", \"output\": \"positive\"}\n\n{\"input\": \"b\", \"output\": \"negative\"}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("more.json"),
            r#"[{"instruction": "x", "input": "c", "output": "positive"}]"#,
        )
        .unwrap();

        let t = task(dir.path());
        let rows = t.load_train_data(&DataSource::from_path(dir.path()), None).unwrap();
        assert_eq!(rows.len(), 3);
        // name order: more.json before train.jsonl
        assert_eq!(rows[0].input, "c");
        assert_eq!(rows[2].output, "negative");
    }

    #[test]
    fn test_iteration_selects_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("train_1.jsonl"), "{\"input\": \"one\", \"output\": \"positive\"}\n").unwrap();
        fs::write(dir.path().join("train_2.jsonl"), "{\"input\": \"two\", \"output\": \"negative\"}\n").unwrap();
        fs::write(dir.path().join("train_12.jsonl"), "{\"input\": \"twelve\", \"output\": \"negative\"}\n").unwrap();

        let t = task(dir.path());
        let rows = t.load_train_data(&DataSource::from_path(dir.path()), Some(2)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input, "two");
        assert!(t.load_train_data(&DataSource::from_path(dir.path()), Some(7)).unwrap().is_empty());
    }

    #[test]
    fn test_empty_file_is_empty_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.json");
        fs::write(&path, "").unwrap();
        let t = task(dir.path());
        assert!(t.load_train_data(&DataSource::File(path), None).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let t = task(dir.path());
        assert!(t
            .load_train_data(&DataSource::File(dir.path().join("nope.jsonl")), None)
            .is_err());
    }

    #[test]
    fn test_eval_input_prefers_inline_text() {
        let dir = TempDir::new().unwrap();
        let t = task(dir.path());
        let request = EvalRequest {
            instruction: Some("classify".to_string()),
            input: Some("fine movie".to_string()),
            ..EvalRequest::default()
        };
        let items = t.get_eval_input(&request).unwrap();
        assert_eq!(items, vec![EvalItem::new("classify", "fine movie")]);
    }

    #[test]
    fn test_eval_input_without_source_fails() {
        let dir = TempDir::new().unwrap();
        assert!(task(dir.path()).get_eval_input(&EvalRequest::default()).is_err());
    }

    #[test]
    fn test_eval_output_writes_annotated_jsonl() {
        let dir = TempDir::new().unwrap();
        let t = task(dir.path());
        let mut item = EvalItem::new("", "good");
        item.output = Some("positive".to_string());
        item.ac_output = Some("positive".to_string());

        let request = EvalRequest {
            iteration: Some(3),
            test_iteration: Some(1),
            ..EvalRequest::default()
        };
        let report = t.eval_output(&[item], &request).unwrap();
        assert_eq!(report.accuracy, Some(1.0));

        let path = report.output_path.unwrap();
        assert_eq!(path, dir.path().join("eval-3-1.jsonl"));
        let written = fs::read_to_string(path).unwrap();
        assert!(written.contains("\"ac_output\":\"positive\""));
    }
}
