//! CWR* weight consolidation.
//!
//! After the first experience every layer up to the penultimate one is frozen
//! and only the classifier learns. Each class keeps a consolidated weight row,
//! a running average across the experiences in which the class appeared,
//! weighted by how many samples of it each experience contained.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::error::{ContinualError, Result};
use crate::model::{layer_params, ContinualModel, LayerParams};
use crate::plugins::StrategyPlugin;
use crate::strategy::StrategyState;

/// Classifier weight consolidation with a frozen feature extractor.
#[derive(Debug)]
pub struct CwrStarPlugin {
    second_last_layer_name: String,
    classifier: String,
    num_classes: usize,
    saved: BTreeMap<u32, Vec<f32>>,
    past_j: BTreeMap<u32, usize>,
    cur_j: BTreeMap<u32, usize>,
}

impl CwrStarPlugin {
    /// Plugin name.
    pub const NAME: &'static str = "cwr_star";

    /// Create the plugin for `model`.
    ///
    /// The classifier is the last entry of [`ContinualModel::layer_names`].
    ///
    /// # Errors
    ///
    /// Returns an error if `second_last_layer_name` is not a layer of the model
    /// or is its last layer, if `num_classes` is zero, or if the classifier has
    /// fewer than `num_classes` outputs.
    pub fn new(
        model: &dyn ContinualModel,
        second_last_layer_name: impl Into<String>,
        num_classes: usize,
    ) -> Result<Self> {
        let second_last_layer_name = second_last_layer_name.into();
        let layers = model.layer_names();

        let position = layers
            .iter()
            .position(|l| *l == second_last_layer_name)
            .ok_or_else(|| {
                ContinualError::plugin(
                    Self::NAME,
                    format!("model has no layer named `{second_last_layer_name}`"),
                )
            })?;
        if position + 1 == layers.len() {
            return Err(ContinualError::plugin(
                Self::NAME,
                format!("`{second_last_layer_name}` is the last layer of the model"),
            ));
        }
        if num_classes == 0 {
            return Err(ContinualError::plugin(Self::NAME, "num_classes must be > 0"));
        }

        let classifier = layers[layers.len() - 1].clone();
        let params = layer_params(model, &classifier)
            .map_err(|e| ContinualError::plugin(Self::NAME, e.to_string()))?;
        if params.out_features() < num_classes {
            return Err(ContinualError::plugin(
                Self::NAME,
                format!(
                    "classifier `{classifier}` has {} outputs, fewer than num_classes {num_classes}",
                    params.out_features()
                ),
            ));
        }

        Ok(Self {
            second_last_layer_name,
            classifier,
            num_classes,
            saved: BTreeMap::new(),
            past_j: BTreeMap::new(),
            cur_j: BTreeMap::new(),
        })
    }

    /// Last layer that is frozen after the first experience.
    #[must_use]
    pub fn second_last_layer_name(&self) -> &str {
        &self.second_last_layer_name
    }

    /// Total number of classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Classes that have a consolidated row.
    #[must_use]
    pub fn consolidated_classes(&self) -> Vec<u32> {
        self.saved.keys().copied().collect()
    }

    /// Consolidated classifier row of `class`.
    #[must_use]
    pub fn consolidated_row(&self, class: u32) -> Option<&[f32]> {
        self.saved.get(&class).map(Vec::as_slice)
    }

    /// Samples of `class` seen in consolidated experiences.
    #[must_use]
    pub fn past_count(&self, class: u32) -> usize {
        self.past_j.get(&class).copied().unwrap_or(0)
    }

    /// Samples per class in the current experience.
    #[must_use]
    pub fn current_counts(&self) -> &BTreeMap<u32, usize> {
        &self.cur_j
    }

    fn freeze_lower_layers(&self, state: &mut StrategyState) -> Result<()> {
        let layers = state.model().layer_names();
        for layer in &layers {
            state.freeze_layer(layer)?;
            if *layer == self.second_last_layer_name {
                break;
            }
        }
        tracing::info!(
            "Froze layers up to `{}`; {} parameter tensors remain trainable",
            self.second_last_layer_name,
            state.optimizer().num_params()
        );
        Ok(())
    }

    fn classifier_params(&self, state: &StrategyState) -> Result<LayerParams> {
        layer_params(state.model(), &self.classifier)
    }

    /// Zero the classifier, then restore the rows of the current classes.
    fn reset_weights(&self, state: &StrategyState) -> Result<()> {
        let params = self.classifier_params(state)?;
        let mut rows = vec![vec![0.0f32; params.in_features()]; params.out_features()];
        for class in self.cur_j.keys() {
            if let Some(saved) = self.saved.get(class) {
                rows[*class as usize].clone_from(saved);
            }
        }
        write_rows(&params, &rows)
    }

    fn consolidate_weights(&mut self, state: &StrategyState) -> Result<()> {
        let params = self.classifier_params(state)?;
        let rows = read_rows(&params)?;

        let current: Vec<u32> = self.cur_j.keys().copied().collect();
        let (sum, count) = current
            .iter()
            .flat_map(|&c| rows[c as usize].iter())
            .fold((0.0f64, 0usize), |(s, n), &w| (s + f64::from(w), n + 1));
        if count == 0 {
            return Ok(());
        }
        let globavg = (sum / count as f64) as f32;

        for class in current {
            let cur = self.cur_j[&class];
            let new_w: Vec<f32> = rows[class as usize].iter().map(|w| w - globavg).collect();
            match self.saved.get_mut(&class) {
                Some(saved) => {
                    let past = self.past_j.get(&class).copied().unwrap_or(0);
                    let w = (past as f32 / cur as f32).sqrt();
                    for (s, n) in saved.iter_mut().zip(&new_w) {
                        *s = (*s * w + n) / (w + 1.0);
                    }
                    *self.past_j.entry(class).or_insert(0) += cur;
                }
                None => {
                    self.saved.insert(class, new_w);
                    self.past_j.insert(class, cur);
                }
            }
        }
        Ok(())
    }

    /// Write every consolidated row into the classifier.
    fn set_consolidated_weights(&self, state: &StrategyState) -> Result<()> {
        let params = self.classifier_params(state)?;
        let mut rows = read_rows(&params)?;
        for (class, saved) in &self.saved {
            rows[*class as usize].clone_from(saved);
        }
        write_rows(&params, &rows)
    }
}

fn read_rows(params: &LayerParams) -> Result<Vec<Vec<f32>>> {
    Ok(params.weight.as_tensor().to_dtype(DType::F32)?.to_vec2::<f32>()?)
}

fn write_rows(params: &LayerParams, rows: &[Vec<f32>]) -> Result<()> {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    let tensor = Tensor::from_vec(
        flat,
        (params.out_features(), params.in_features()),
        params.weight.device(),
    )?
    .to_dtype(params.weight.dtype())?;
    params.weight.set(&tensor)?;
    Ok(())
}

impl StrategyPlugin for CwrStarPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn before_training_exp(&mut self, state: &mut StrategyState) -> Result<()> {
        if state.train_exp_counter > 0 {
            self.freeze_lower_layers(state)?;
        }

        let dataset = state
            .dataset
            .as_ref()
            .ok_or_else(|| ContinualError::plugin(Self::NAME, "no current training dataset"))?;
        let counts = dataset.class_counts();
        if let Some(&class) = counts.keys().find(|&&c| c as usize >= self.num_classes) {
            return Err(ContinualError::plugin(
                Self::NAME,
                format!("class {class} exceeds num_classes {}", self.num_classes),
            ));
        }
        self.cur_j = counts;

        self.reset_weights(state)
    }

    fn after_training_exp(&mut self, state: &mut StrategyState) -> Result<()> {
        self.consolidate_weights(state)?;
        self.set_consolidated_weights(state)?;
        tracing::debug!(
            "Consolidated {} classes: {:?}",
            self.saved.len(),
            self.consolidated_classes()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::criterion::CrossEntropyLoss;
    use crate::dataset::TensorDataset;
    use crate::model::{SimpleMlp, SimpleMlpConfig};
    use crate::optimizer::OptimizerConfig;
    use candle_core::Device;

    fn state() -> StrategyState {
        let config = SimpleMlpConfig {
            input_size: 3,
            hidden_size: 2,
            hidden_layers: 1,
            num_classes: 4,
            dropout: 0.0,
        };
        let model = SimpleMlp::new(&config, &Device::Cpu).unwrap();
        let optimizer = OptimizerConfig::sgd(0.1)
            .build(model.var_map().all_vars())
            .unwrap();
        StrategyState::new(
            Box::new(model),
            optimizer,
            Box::new(CrossEntropyLoss),
            StrategyConfig::default(),
            Device::Cpu,
        )
    }

    fn dataset(targets: Vec<u32>) -> TensorDataset {
        let rows = vec![vec![0.0f32; 3]; targets.len()];
        TensorDataset::from_rows(&rows, targets).unwrap()
    }

    fn set_classifier(state: &StrategyState, rows: &[[f32; 2]; 4]) {
        let params = layer_params(state.model(), "classifier").unwrap();
        let rows: Vec<Vec<f32>> = rows.iter().map(|r| r.to_vec()).collect();
        write_rows(&params, &rows).unwrap();
    }

    fn classifier(state: &StrategyState) -> Vec<Vec<f32>> {
        read_rows(&layer_params(state.model(), "classifier").unwrap()).unwrap()
    }

    fn assert_rows_close(actual: &[Vec<f32>], expected: &[[f32; 2]; 4]) {
        for (a, e) in actual.iter().zip(expected) {
            for (x, y) in a.iter().zip(e) {
                assert!((x - y).abs() < 1e-5, "{actual:?} != {expected:?}");
            }
        }
    }

    #[test]
    fn test_construction_checks() {
        let state = state();
        assert!(CwrStarPlugin::new(state.model(), "features.0", 4).is_ok());
        assert!(CwrStarPlugin::new(state.model(), "features.7", 4).is_err());
        assert!(CwrStarPlugin::new(state.model(), "classifier", 4).is_err());
        assert!(CwrStarPlugin::new(state.model(), "features.0", 0).is_err());
        assert!(CwrStarPlugin::new(state.model(), "features.0", 5).is_err());

        let plugin = CwrStarPlugin::new(state.model(), "features.0", 3).unwrap();
        assert_eq!(plugin.second_last_layer_name(), "features.0");
        assert_eq!(plugin.num_classes(), 3);
    }

    #[test]
    fn test_class_out_of_range() {
        let mut state = state();
        let mut plugin = CwrStarPlugin::new(state.model(), "features.0", 2).unwrap();
        state.dataset = Some(dataset(vec![0, 1, 3]));
        let err = plugin.before_training_exp(&mut state).unwrap_err();
        assert!(err.to_string().contains("class 3"));
    }

    #[test]
    fn test_first_experience_is_not_frozen() {
        let mut state = state();
        let mut plugin = CwrStarPlugin::new(state.model(), "features.0", 4).unwrap();
        state.dataset = Some(dataset(vec![0, 1]));
        plugin.before_training_exp(&mut state).unwrap();

        assert!(state.frozen().is_empty());
        assert_eq!(classifier(&state), vec![vec![0.0; 2]; 4]);
    }

    #[test]
    fn test_consolidation_over_two_experiences() {
        let mut state = state();
        let mut plugin = CwrStarPlugin::new(state.model(), "features.0", 4).unwrap();

        // Experience 0: classes 0 and 1, three samples each.
        state.dataset = Some(dataset(vec![0, 0, 0, 1, 1, 1]));
        plugin.before_training_exp(&mut state).unwrap();
        set_classifier(&state, &[[1.0, 3.0], [3.0, 5.0], [9.0, 9.0], [9.0, 9.0]]);
        plugin.after_training_exp(&mut state).unwrap();

        // globavg = 3
        assert_eq!(plugin.consolidated_row(0), Some(&[-2.0f32, 0.0][..]));
        assert_eq!(plugin.consolidated_row(1), Some(&[0.0f32, 2.0][..]));
        assert_eq!(plugin.past_count(0), 3);
        assert_rows_close(
            &classifier(&state),
            &[[-2.0, 0.0], [0.0, 2.0], [9.0, 9.0], [9.0, 9.0]],
        );
        state.train_exp_counter = 1;

        // Experience 1: twelve samples of class 0, four of class 2.
        let mut targets = vec![0; 12];
        targets.extend([2; 4]);
        state.dataset = Some(dataset(targets));
        plugin.before_training_exp(&mut state).unwrap();

        assert!(state.is_frozen("features.0.weight"));
        assert!(state.is_frozen("features.0.bias"));
        assert!(!state.is_frozen("classifier.weight"));
        assert_eq!(state.optimizer().num_params(), 2);
        assert_rows_close(
            &classifier(&state),
            &[[-2.0, 0.0], [0.0, 0.0], [0.0, 0.0], [0.0, 0.0]],
        );

        set_classifier(&state, &[[4.0, 4.0], [0.0, 0.0], [2.0, 6.0], [0.0, 0.0]]);
        plugin.after_training_exp(&mut state).unwrap();

        // globavg = 4, w = sqrt(3 / 12) = 0.5
        // class 0: ([-2, 0] * 0.5 + [0, 0]) / 1.5
        assert_rows_close(
            &classifier(&state),
            &[[-2.0 / 3.0, 0.0], [0.0, 2.0], [-2.0, 2.0], [0.0, 0.0]],
        );
        assert_eq!(plugin.past_count(0), 15);
        assert_eq!(plugin.past_count(2), 4);
        assert_eq!(plugin.consolidated_classes(), vec![0, 1, 2]);
    }
}
