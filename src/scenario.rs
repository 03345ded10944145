//! Continual-learning benchmarks: experiences, class-incremental splits and
//! synthetic data.

use std::collections::BTreeSet;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::dataset::TensorDataset;
use crate::error::{ContinualError, Result};

/// One step of a continual-learning stream.
#[derive(Debug, Clone)]
pub struct Experience {
    /// Position in the stream.
    pub index: usize,
    /// Task label (0 for every experience of a class-incremental stream).
    pub task_label: usize,
    /// Classes introduced by this experience.
    pub classes: Vec<u32>,
    /// Training data.
    pub train: TensorDataset,
    /// Test data restricted to `classes`.
    pub test: TensorDataset,
}

/// Options for [`Scenario::class_incremental`].
#[derive(Debug, Clone, Default)]
pub struct SplitOptions {
    /// Assign task label `i` to experience `i`.
    pub task_labels: bool,
    /// Fixed class order; takes precedence over `seed`.
    pub class_order: Option<Vec<u32>>,
    /// Shuffle the sorted class list with this seed.
    pub seed: Option<u64>,
}

/// An ordered stream of experiences.
#[derive(Debug, Clone)]
pub struct Scenario {
    experiences: Vec<Experience>,
    class_order: Vec<u32>,
}

impl Scenario {
    /// Split a dataset into `n_experiences` disjoint groups of classes.
    ///
    /// # Errors
    ///
    /// Returns an error if `n_experiences` is zero, exceeds the number of
    /// classes or does not divide it, or if a fixed class order is not a
    /// permutation of the training classes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use continual_rs::scenario::{Scenario, SplitOptions, SyntheticBlobs};
    ///
    /// # fn main() -> continual_rs::Result<()> {
    /// let blobs = SyntheticBlobs::new(4, 8, 3.0, 0)?;
    /// let scenario = Scenario::class_incremental(
    ///     blobs.sample(20, 1)?,
    ///     blobs.sample(10, 2)?,
    ///     2,
    ///     SplitOptions { task_labels: true, ..Default::default() },
    /// )?;
    ///
    /// assert_eq!(scenario.len(), 2);
    /// assert_eq!(scenario.experiences()[1].task_label, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub fn class_incremental(
        train: TensorDataset,
        test: TensorDataset,
        n_experiences: usize,
        options: SplitOptions,
    ) -> Result<Self> {
        if train.feature_dim() != test.feature_dim() {
            return Err(ContinualError::Scenario(format!(
                "train has {} features, test has {}",
                train.feature_dim(),
                test.feature_dim()
            )));
        }

        let classes = train.classes();
        let class_order = match options.class_order {
            Some(order) => {
                let as_set: BTreeSet<u32> = order.iter().copied().collect();
                if as_set != classes || as_set.len() != order.len() {
                    return Err(ContinualError::Scenario(
                        "class_order must be a permutation of the training classes".into(),
                    ));
                }
                order
            }
            None => {
                let mut order: Vec<u32> = classes.iter().copied().collect();
                if let Some(seed) = options.seed {
                    order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
                }
                order
            }
        };

        if n_experiences == 0 {
            return Err(ContinualError::Scenario("n_experiences must be > 0".into()));
        }
        if n_experiences > class_order.len() || class_order.len() % n_experiences != 0 {
            return Err(ContinualError::Scenario(format!(
                "{} classes cannot be split evenly into {} experiences",
                class_order.len(),
                n_experiences
            )));
        }

        let per_experience = class_order.len() / n_experiences;
        let experiences = class_order
            .chunks(per_experience)
            .enumerate()
            .map(|(index, group)| {
                let group_set: BTreeSet<u32> = group.iter().copied().collect();
                Ok(Experience {
                    index,
                    task_label: if options.task_labels { index } else { 0 },
                    classes: group.to_vec(),
                    train: train.filter_classes(&group_set)?,
                    test: test.filter_classes(&group_set)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "Built class-incremental scenario: {} experiences, class order {:?}",
            experiences.len(),
            class_order
        );

        Ok(Self {
            experiences,
            class_order,
        })
    }

    /// All experiences, in stream order.
    #[must_use]
    pub fn experiences(&self) -> &[Experience] {
        &self.experiences
    }

    /// Number of experiences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiences.len()
    }

    /// Whether the stream is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiences.is_empty()
    }

    /// Order in which classes are introduced.
    #[must_use]
    pub fn class_order(&self) -> &[u32] {
        &self.class_order
    }

    /// Total number of classes across the stream.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.class_order.len()
    }
}

/// Gaussian class clusters with seeded centers.
///
/// Each class has a center drawn from `N(0, separation²)`; samples are the
/// center plus unit Gaussian noise.
#[derive(Debug, Clone)]
pub struct SyntheticBlobs {
    centers: Vec<Vec<f32>>,
}

impl SyntheticBlobs {
    /// Draw class centers.
    pub fn new(num_classes: usize, dim: usize, separation: f32, seed: u64) -> Result<Self> {
        if num_classes == 0 || dim == 0 {
            return Err(ContinualError::Dataset(
                "synthetic blobs need at least one class and one feature".into(),
            ));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let centers = (0..num_classes)
            .map(|_| {
                (0..dim)
                    .map(|_| {
                        let z: f32 = StandardNormal.sample(&mut rng);
                        z * separation
                    })
                    .collect()
            })
            .collect();
        Ok(Self { centers })
    }

    /// Number of classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.centers.len()
    }

    /// Draw `per_class` samples of every class, grouped by class.
    pub fn sample(&self, per_class: usize, seed: u64) -> Result<TensorDataset> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let dim = self.centers[0].len();
        let total = per_class * self.centers.len();

        let mut flat = Vec::with_capacity(total * dim);
        let mut targets = Vec::with_capacity(total);
        for (class, center) in self.centers.iter().enumerate() {
            for _ in 0..per_class {
                for &mu in center {
                    let noise: f32 = StandardNormal.sample(&mut rng);
                    flat.push(mu + noise);
                }
                targets.push(class as u32);
            }
        }

        let features = Tensor::from_vec(flat, (total, dim), &Device::Cpu)?;
        TensorDataset::new(features, targets)
    }
}
