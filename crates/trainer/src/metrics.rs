//! Metrics collaborators and aggregation helpers.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};
use thiserror::Error;

use crate::data::ExtraFields;

/// Flat metric name to value mapping, ordered for stable logs.
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("{predictions} predictions for {labels} labels")]
    BatchSizeMismatch { predictions: usize, labels: usize },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Generated ids and references for one batch.
pub struct EvalPrediction<'a> {
    /// `[b, 1 + generated]`, starting with the decoder start token.
    pub predictions: &'a Tensor,
    /// `[b, tgt_len]`, padded with `pad_token_id`.
    pub label_ids: &'a Tensor,
    pub extra_fields: &'a [ExtraFields],
}

/// Per-task metric computation, fed batch by batch.
pub trait MetricsProvider {
    /// Accumulate one batch; may return batch-level metrics under `prefix`.
    fn compute_metrics(&mut self, eval: &EvalPrediction<'_>, prefix: &str) -> Result<Metrics, MetricsError>;

    /// Metrics over everything accumulated since the last reset.
    fn compute_metrics_all(&mut self, prefix: &str) -> Result<Metrics, MetricsError>;

    fn reset_metrics(&mut self);
}

/// Fraction of predictions whose token sequence equals the label sequence.
///
/// Both sides are cut at the first EOS and stripped of padding; predictions
/// also drop their leading decoder start token.
#[derive(Debug, Clone)]
pub struct ExactMatch {
    pad_token_id: u32,
    eos_token_id: u32,
    correct: usize,
    total: usize,
}

impl ExactMatch {
    pub fn new(pad_token_id: u32, eos_token_id: u32) -> Self {
        Self {
            pad_token_id,
            eos_token_id,
            correct: 0,
            total: 0,
        }
    }

    fn normalize(&self, ids: &[u32]) -> Vec<u32> {
        ids.iter()
            .copied()
            .take_while(|&id| id != self.eos_token_id)
            .filter(|&id| id != self.pad_token_id)
            .collect()
    }
}

impl MetricsProvider for ExactMatch {
    fn compute_metrics(&mut self, eval: &EvalPrediction<'_>, prefix: &str) -> Result<Metrics, MetricsError> {
        let predictions: Vec<Vec<u32>> = eval.predictions.to_dtype(DType::U32)?.to_vec2()?;
        let labels: Vec<Vec<u32>> = eval.label_ids.to_dtype(DType::U32)?.to_vec2()?;
        if predictions.len() != labels.len() {
            return Err(MetricsError::BatchSizeMismatch {
                predictions: predictions.len(),
                labels: labels.len(),
            });
        }

        let mut correct = 0;
        for (pred, label) in predictions.iter().zip(&labels) {
            let pred = pred.get(1..).unwrap_or_default();
            if self.normalize(pred) == self.normalize(label) {
                correct += 1;
            }
        }
        self.correct += correct;
        self.total += labels.len();

        let mut metrics = Metrics::new();
        if !labels.is_empty() {
            metrics.insert(
                format!("{prefix}_batch_exact_match"),
                correct as f64 / labels.len() as f64,
            );
        }
        Ok(metrics)
    }

    fn compute_metrics_all(&mut self, prefix: &str) -> Result<Metrics, MetricsError> {
        let mut metrics = Metrics::new();
        if self.total > 0 {
            metrics.insert(
                format!("{prefix}_exact_match"),
                self.correct as f64 / self.total as f64,
            );
        }
        Ok(metrics)
    }

    fn reset_metrics(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Mean of every metric whose name contains `keyword` but not `avg`,
/// keyed `avg_{keyword}`. `None` when nothing matches.
pub fn get_avg(metrics: &Metrics, keyword: &str) -> Option<(String, f64)> {
    let values: Vec<f64> = metrics
        .iter()
        .filter(|(name, _)| name.contains(keyword) && !name.contains("avg"))
        .map(|(_, &v)| v)
        .collect();
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some((format!("avg_{keyword}"), mean))
}
