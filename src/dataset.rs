//! In-memory tensor datasets and minibatch iteration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

use crate::error::{ContinualError, Result};

/// A labelled dataset held as one `(N, D)` feature tensor plus class targets.
///
/// Cloning is cheap: the feature tensor shares its storage.
///
/// # Example
///
/// ```rust
/// use continual_rs::dataset::TensorDataset;
///
/// # fn main() -> continual_rs::Result<()> {
/// let dataset = TensorDataset::from_rows(
///     &[vec![0.0, 1.0], vec![1.0, 0.0], vec![0.5, 0.5]],
///     vec![0, 1, 1],
/// )?;
///
/// assert_eq!(dataset.len(), 3);
/// assert_eq!(dataset.feature_dim(), 2);
/// assert_eq!(dataset.class_counts()[&1], 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TensorDataset {
    features: Tensor,
    targets: Vec<u32>,
}

/// One line of a JSON-lines dataset file.
#[derive(Debug, Deserialize)]
struct JsonlRecord {
    features: Vec<f32>,
    label: u32,
}

impl TensorDataset {
    /// Wrap a feature tensor and its targets.
    ///
    /// # Errors
    ///
    /// Returns an error if `features` is not rank 2 or its row count differs
    /// from the number of targets.
    pub fn new(features: Tensor, targets: Vec<u32>) -> Result<Self> {
        let dims = features.dims();
        if dims.len() != 2 {
            return Err(ContinualError::Dataset(format!(
                "features must be a (samples, features) matrix, got shape {:?}",
                dims
            )));
        }
        if dims[0] != targets.len() {
            return Err(ContinualError::Dataset(format!(
                "{} feature rows but {} targets",
                dims[0],
                targets.len()
            )));
        }
        let features = features.to_dtype(DType::F32)?;
        Ok(Self { features, targets })
    }

    /// Build a CPU dataset from feature rows.
    pub fn from_rows(rows: &[Vec<f32>], targets: Vec<u32>) -> Result<Self> {
        if rows.len() != targets.len() {
            return Err(ContinualError::Dataset(format!(
                "{} feature rows but {} targets",
                rows.len(),
                targets.len()
            )));
        }
        let dim = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|row| row.len() != dim) {
            return Err(ContinualError::Dataset(format!(
                "row {} has {} features, expected {}",
                bad,
                rows[bad].len(),
                dim
            )));
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let features = Tensor::from_vec(flat, (rows.len(), dim), &Device::Cpu)?;
        Self::new(features, targets)
    }

    /// Load a JSON-lines file with one `{"features": [...], "label": n}` per line.
    ///
    /// Blank lines are skipped.
    pub fn from_jsonl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: JsonlRecord = serde_json::from_str(line).map_err(|e| {
                ContinualError::Dataset(format!("{}:{}: {}", path.display(), lineno + 1, e))
            })?;
            rows.push(record.features);
            targets.push(record.label);
        }

        tracing::debug!("Loaded {} samples from {}", rows.len(), path.display());
        Self::from_rows(&rows, targets)
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the dataset has no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Number of features per sample.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.features.dims()[1]
    }

    /// Feature matrix.
    #[must_use]
    pub fn features(&self) -> &Tensor {
        &self.features
    }

    /// Class targets.
    #[must_use]
    pub fn targets(&self) -> &[u32] {
        &self.targets
    }

    /// Distinct classes present.
    #[must_use]
    pub fn classes(&self) -> BTreeSet<u32> {
        self.targets.iter().copied().collect()
    }

    /// Number of samples per class.
    #[must_use]
    pub fn class_counts(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for &target in &self.targets {
            *counts.entry(target).or_insert(0) += 1;
        }
        counts
    }

    /// Select samples by index, in the given order.
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(ContinualError::Dataset(format!(
                "index {} out of range for {} samples",
                bad,
                self.len()
            )));
        }
        if indices.is_empty() {
            let features = Tensor::zeros(
                (0, self.feature_dim()),
                DType::F32,
                self.features.device(),
            )?;
            return Ok(Self {
                features,
                targets: Vec::new(),
            });
        }

        let index = index_tensor(indices, self.features.device())?;
        let features = self.features.index_select(&index, 0)?;
        let targets = indices.iter().map(|&i| self.targets[i]).collect();
        Ok(Self { features, targets })
    }

    /// Keep only the samples whose class is in `classes`.
    pub fn filter_classes(&self, classes: &BTreeSet<u32>) -> Result<Self> {
        let indices: Vec<usize> = self
            .targets
            .iter()
            .enumerate()
            .filter(|(_, target)| classes.contains(target))
            .map(|(i, _)| i)
            .collect();
        self.subset(&indices)
    }

    /// A random permutation of the sample indices.
    pub fn shuffled_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order
    }

    /// Iterate over minibatches of at most `batch_size` samples.
    ///
    /// `order` defaults to sequential order. The last batch may be short.
    pub fn minibatches(&self, batch_size: usize, order: Option<Vec<usize>>) -> Result<MiniBatches<'_>> {
        if batch_size == 0 {
            return Err(ContinualError::Dataset("batch size must be > 0".into()));
        }
        let order = order.unwrap_or_else(|| (0..self.len()).collect());
        if order.len() != self.len() {
            return Err(ContinualError::Dataset(format!(
                "batch order covers {} of {} samples",
                order.len(),
                self.len()
            )));
        }
        Ok(MiniBatches {
            dataset: self,
            order,
            batch_size,
            cursor: 0,
        })
    }

    fn batch(&self, indices: &[usize]) -> Result<Batch> {
        let device = self.features.device();
        let index = index_tensor(indices, device)?;
        let inputs = self.features.index_select(&index, 0)?;
        let targets: Vec<u32> = indices.iter().map(|&i| self.targets[i]).collect();
        let targets = Tensor::from_vec(targets, indices.len(), device)?;
        Ok(Batch { inputs, targets })
    }
}

fn index_tensor(indices: &[usize], device: &Device) -> Result<Tensor> {
    let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    Ok(Tensor::from_vec(ids, indices.len(), device)?)
}

/// A minibatch of inputs and `u32` class targets.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs: (batch, features)
    pub inputs: Tensor,
    /// Targets: (batch,)
    pub targets: Tensor,
}

impl Batch {
    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.dims1().unwrap_or(0)
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move both tensors to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            inputs: self.inputs.to_device(device)?,
            targets: self.targets.to_device(device)?,
        })
    }
}

/// Iterator over the minibatches of a [`TensorDataset`].
pub struct MiniBatches<'a> {
    dataset: &'a TensorDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl MiniBatches<'_> {
    /// Total number of batches this iterator yields.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl Iterator for MiniBatches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let chunk = &self.order[self.cursor..end];
        self.cursor = end;
        Some(self.dataset.batch(chunk))
    }
}
