//! Evaluation protocol and metrics.
//!
//! The base strategy drives an [`EvalProtocol`] while testing: every metric is
//! reset before an experience, updated once per test minibatch and read out
//! when the experience is done. Each read-out becomes an [`EvalRecord`].

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{ContinualError, Result};

/// A streaming evaluation metric.
pub trait Metric: Send {
    /// Key under which results are recorded.
    fn name(&self) -> &str;

    /// Clear per-experience state.
    fn reset(&mut self);

    /// Accumulate one minibatch.
    fn update(&mut self, logits: &Tensor, targets: &Tensor, loss: f32) -> Result<()>;

    /// Value for the experience that was just evaluated.
    fn result(&mut self, experience: usize) -> f64;
}

pub(crate) fn count_correct(logits: &Tensor, targets: &Tensor) -> Result<(usize, usize)> {
    let predictions = logits.argmax(D::Minus1)?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let targets = targets.to_vec1::<u32>()?;
    if predictions.len() != targets.len() {
        return Err(ContinualError::Evaluation(format!(
            "{} predictions for {} targets",
            predictions.len(),
            targets.len()
        )));
    }
    let correct = predictions
        .iter()
        .zip(&targets)
        .filter(|(p, t)| p == t)
        .count();
    Ok((correct, targets.len()))
}

/// Fraction of correctly classified samples.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    /// Accuracy so far, 0 when nothing has been seen.
    #[must_use]
    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

impl Metric for Accuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }

    fn update(&mut self, logits: &Tensor, targets: &Tensor, _loss: f32) -> Result<()> {
        let (correct, total) = count_correct(logits, targets)?;
        self.correct += correct;
        self.total += total;
        Ok(())
    }

    fn result(&mut self, _experience: usize) -> f64 {
        self.value()
    }
}

/// Sample-weighted mean loss.
#[derive(Debug, Clone, Default)]
pub struct AverageLoss {
    sum: f64,
    count: usize,
}

impl Metric for AverageLoss {
    fn name(&self) -> &str {
        "loss"
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    fn update(&mut self, _logits: &Tensor, targets: &Tensor, loss: f32) -> Result<()> {
        let n = targets.dims1()?;
        self.sum += f64::from(loss) * n as f64;
        self.count += n;
        Ok(())
    }

    fn result(&mut self, _experience: usize) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Drop from the best earlier accuracy on an experience to the current one.
///
/// Zero the first time an experience is evaluated.
#[derive(Debug, Clone, Default)]
pub struct Forgetting {
    current: Accuracy,
    best: HashMap<usize, f64>,
}

impl Metric for Forgetting {
    fn name(&self) -> &str {
        "forgetting"
    }

    fn reset(&mut self) {
        self.current.reset();
    }

    fn update(&mut self, logits: &Tensor, targets: &Tensor, loss: f32) -> Result<()> {
        self.current.update(logits, targets, loss)
    }

    fn result(&mut self, experience: usize) -> f64 {
        let accuracy = self.current.value();
        match self.best.get_mut(&experience) {
            Some(best) => {
                let forgetting = *best - accuracy;
                *best = best.max(accuracy);
                forgetting
            }
            None => {
                self.best.insert(experience, accuracy);
                0.0
            }
        }
    }
}

/// Metrics of one test experience after some amount of training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    /// Training experiences completed when this was measured.
    pub trained_experiences: usize,
    /// Evaluated experience index.
    pub experience: usize,
    /// Its task label.
    pub task_label: usize,
    /// Metric name to value.
    pub metrics: BTreeMap<String, f64>,
}

/// Every record produced by an [`EvalProtocol`], in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    records: Vec<EvalRecord>,
}

impl EvalResults {
    /// All records.
    #[must_use]
    pub fn records(&self) -> &[EvalRecord] {
        &self.records
    }

    /// Most recent value of `metric` on `experience`.
    #[must_use]
    pub fn latest(&self, metric: &str, experience: usize) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .find(|r| r.experience == experience)
            .and_then(|r| r.metrics.get(metric).copied())
    }

    /// Mean of `metric` over the records of the most recent evaluation round.
    #[must_use]
    pub fn last_round_average(&self, metric: &str) -> Option<f64> {
        let round = self.records.last()?.trained_experiences;
        let values: Vec<f64> = self
            .records
            .iter()
            .filter(|r| r.trained_experiences == round)
            .filter_map(|r| r.metrics.get(metric).copied())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Set of metrics evaluated on every test experience.
///
/// # Example
///
/// ```rust
/// use continual_rs::evaluation::{Accuracy, EvalProtocol};
///
/// let protocol = EvalProtocol::new().with_metric(Accuracy::default());
/// assert_eq!(protocol.metric_names(), vec!["accuracy"]);
/// ```
#[derive(Default)]
pub struct EvalProtocol {
    metrics: Vec<Box<dyn Metric>>,
    results: EvalResults,
}

impl EvalProtocol {
    /// Protocol with no metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accuracy, average loss and forgetting.
    #[must_use]
    pub fn with_default_metrics() -> Self {
        Self::new()
            .with_metric(Accuracy::default())
            .with_metric(AverageLoss::default())
            .with_metric(Forgetting::default())
    }

    /// Add a metric (builder form).
    #[must_use]
    pub fn with_metric<M: Metric + 'static>(mut self, metric: M) -> Self {
        self.add_metric(Box::new(metric));
        self
    }

    /// Add a metric.
    pub fn add_metric(&mut self, metric: Box<dyn Metric>) {
        self.metrics.push(metric);
    }

    /// Names of the registered metrics.
    #[must_use]
    pub fn metric_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|m| m.name()).collect()
    }

    /// Results recorded so far.
    #[must_use]
    pub fn results(&self) -> &EvalResults {
        &self.results
    }

    pub(crate) fn begin_experience(&mut self) {
        for metric in &mut self.metrics {
            metric.reset();
        }
    }

    pub(crate) fn update(&mut self, logits: &Tensor, targets: &Tensor, loss: f32) -> Result<()> {
        for metric in &mut self.metrics {
            metric.update(logits, targets, loss)?;
        }
        Ok(())
    }

    pub(crate) fn finish_experience(
        &mut self,
        trained_experiences: usize,
        experience: usize,
        task_label: usize,
    ) -> &EvalRecord {
        let metrics: BTreeMap<String, f64> = self
            .metrics
            .iter_mut()
            .map(|m| (m.name().to_string(), m.result(experience)))
            .collect();

        let summary = metrics
            .iter()
            .map(|(name, value)| format!("{name}={value:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(
            "Eval after {} experiences | exp {} (task {}) | {}",
            trained_experiences,
            experience,
            task_label,
            summary
        );

        self.results.records.push(EvalRecord {
            trained_experiences,
            experience,
            task_label,
            metrics,
        });
        &self.results.records[self.results.records.len() - 1]
    }
}

impl std::fmt::Debug for EvalProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalProtocol")
            .field("metrics", &self.metric_names())
            .field("records", &self.results.records.len())
            .finish()
    }
}
