//! One classifier head per task label.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{ContinualError, Result};
use crate::model::{layer_params, reinit_linear, ContinualModel, LayerSnapshot};
use crate::plugins::StrategyPlugin;
use crate::strategy::StrategyState;

/// Swaps the model's classifier for the head of the active task.
///
/// The classifier parameters always hold the head of the task that was
/// switched to last. Heads of inactive tasks are kept as snapshots and written
/// back in place when their task becomes active again.
#[derive(Debug)]
pub struct MultiHeadPlugin {
    classifier_field: String,
    keep_initial_layer: bool,
    initial: Option<LayerSnapshot>,
    heads: BTreeMap<usize, LayerSnapshot>,
    active: Option<usize>,
}

impl MultiHeadPlugin {
    /// Plugin name.
    pub const NAME: &'static str = "multi_head";

    /// Create the plugin for `model`.
    ///
    /// With `keep_initial_layer`, the classifier as it is now becomes the head
    /// of task 0. Otherwise every head, task 0 included, starts freshly
    /// initialized from the strategy seed offset by the task label.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` has no linear layer named `classifier_field`.
    pub fn new(
        model: &dyn ContinualModel,
        classifier_field: impl Into<String>,
        keep_initial_layer: bool,
    ) -> Result<Self> {
        let classifier_field = classifier_field.into();
        let params = layer_params(model, &classifier_field)
            .map_err(|e| ContinualError::plugin(Self::NAME, e.to_string()))?;
        let initial = if keep_initial_layer {
            Some(LayerSnapshot::capture(&params)?)
        } else {
            None
        };

        Ok(Self {
            classifier_field,
            keep_initial_layer,
            initial,
            heads: BTreeMap::new(),
            active: None,
        })
    }

    /// Name of the swapped layer.
    #[must_use]
    pub fn classifier_field(&self) -> &str {
        &self.classifier_field
    }

    /// Whether task 0 reuses the classifier the model was built with.
    #[must_use]
    pub fn keep_initial_layer(&self) -> bool {
        self.keep_initial_layer
    }

    /// Task whose head is currently in the model.
    #[must_use]
    pub fn active_task(&self) -> Option<usize> {
        self.active
    }

    /// Every task that has a head.
    #[must_use]
    pub fn known_tasks(&self) -> Vec<usize> {
        let mut tasks: Vec<usize> = self.heads.keys().copied().chain(self.active).collect();
        tasks.sort_unstable();
        tasks.dedup();
        tasks
    }

    fn switch_to(&mut self, state: &mut StrategyState, task: usize) -> Result<()> {
        if self.active == Some(task) {
            return Ok(());
        }

        let params = layer_params(state.model(), &self.classifier_field)?;
        if let Some(active) = self.active {
            self.heads.insert(active, LayerSnapshot::capture(&params)?);
        }

        match self.heads.get(&task) {
            Some(head) => head.restore(&params)?,
            None => {
                match (&self.initial, task) {
                    (Some(initial), 0) => initial.restore(&params)?,
                    _ => {
                        let seed = state.config().seed.wrapping_add(task as u64);
                        reinit_linear(&params, &mut ChaCha8Rng::seed_from_u64(seed))?;
                    }
                }
                if state.is_training {
                    tracing::debug!("Created classifier head for task {}", task);
                } else {
                    tracing::warn!(
                        "No head trained for task {}; evaluating with a freshly initialized one",
                        task
                    );
                }
            }
        }
        self.active = Some(task);

        if state.is_training {
            state.reset_optimizer()?;
        }
        Ok(())
    }

    fn current_task(state: &StrategyState) -> Result<usize> {
        state
            .experience
            .as_ref()
            .map(|e| e.task_label)
            .ok_or_else(|| ContinualError::plugin(Self::NAME, "no current experience"))
    }
}

impl StrategyPlugin for MultiHeadPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn before_training_exp(&mut self, state: &mut StrategyState) -> Result<()> {
        let task = Self::current_task(state)?;
        self.switch_to(state, task)
    }

    fn before_test_exp(&mut self, state: &mut StrategyState) -> Result<()> {
        let task = Self::current_task(state)?;
        self.switch_to(state, task)
    }
}
