// Metrics logger - appends TrainingMetric records to a JSONL file

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use uuid::Uuid;

use super::types::TrainingMetric;

pub struct MetricsLogger {
    run_id: String,
    writer: BufWriter<File>,
}

impl MetricsLogger {
    /// Open (or create) `path` for appending; every record carries a fresh run id
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create metrics directory {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics file {:?}", path))?;

        let run_id = Uuid::new_v4().to_string();
        tracing::info!(path = %path.display(), run_id = %run_id, "Experiment tracking enabled");

        Ok(Self {
            run_id,
            writer: BufWriter::new(file),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log(&mut self, metric: &TrainingMetric) -> Result<()> {
        let line = serde_json::to_string(metric).context("Failed to serialize metric")?;
        writeln!(self.writer, "{}", line).context("Failed to write metric")?;
        self.writer.flush().context("Failed to flush metrics file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;
    use tempfile::TempDir;

    #[test]
    fn test_appends_one_line_per_metric() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs/metrics.jsonl");
        let mut logger = MetricsLogger::new(&path).unwrap();
        let run_id = logger.run_id().to_string();

        logger
            .log(&TrainingMetric::new(&run_id, MetricKind::Train, 1, 0.1).loss(0.7).learning_rate(1e-4))
            .unwrap();
        logger
            .log(&TrainingMetric::new(&run_id, MetricKind::Eval, 1, 0.1).loss(0.6).accuracy(0.5))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: TrainingMetric = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, MetricKind::Train);
        assert_eq!(first.run_id, run_id);
        assert!(!lines[0].contains("accuracy"));
    }
}
