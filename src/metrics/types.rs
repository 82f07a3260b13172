// Metrics data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Train,
    Eval,
    Summary,
}

/// One line of the metrics file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMetric {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MetricKind,
    pub step: usize,
    pub epoch: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl TrainingMetric {
    pub fn new(run_id: &str, kind: MetricKind, step: usize, epoch: f64) -> Self {
        Self {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            kind,
            step,
            epoch,
            loss: None,
            learning_rate: None,
            grad_norm: None,
            accuracy: None,
        }
    }

    pub fn loss(mut self, loss: f64) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = Some(lr);
        self
    }

    pub fn grad_norm(mut self, norm: f64) -> Self {
        self.grad_norm = Some(norm);
        self
    }

    pub fn accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }
}
