//! Models trained by the strategies and helpers for addressing their layers.
//!
//! Parameters live in a candle [`VarMap`] under `"{layer}.weight"` and
//! `"{layer}.bias"`. Plugins swap or rewrite layers in place through
//! [`Var::set`], so the model's own `Linear` modules see every change without
//! being rebuilt.

use std::collections::HashMap;
use std::path::Path;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ContinualError, Result};

/// A classifier the strategies can train.
///
/// # Example
///
/// ```rust,ignore
/// impl ContinualModel for MyNet {
///     fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
///         self.head.forward(&self.body.forward_t(xs, train)?)
///     }
///     fn var_map(&self) -> &VarMap { &self.var_map }
///     fn layer_names(&self) -> Vec<String> { vec!["body".into(), "head".into()] }
///     fn device(&self) -> &Device { &self.device }
/// }
/// ```
pub trait ContinualModel: Send {
    /// Compute logits. `train` enables dropout and similar train-only behaviour.
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor>;

    /// Every parameter of the model.
    fn var_map(&self) -> &VarMap;

    /// Layer names in forward order. The last entry is the classifier.
    fn layer_names(&self) -> Vec<String>;

    /// Device the parameters live on.
    fn device(&self) -> &Device;
}

impl ContinualModel for Box<dyn ContinualModel> {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        (**self).forward_t(xs, train)
    }

    fn var_map(&self) -> &VarMap {
        (**self).var_map()
    }

    fn layer_names(&self) -> Vec<String> {
        (**self).layer_names()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }
}

/// Architecture of a [`SimpleMlp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleMlpConfig {
    /// Input features.
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    /// Width of every hidden layer.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Number of hidden layers (`features.0` .. `features.{n-1}`).
    #[serde(default = "default_hidden_layers")]
    pub hidden_layers: usize,
    /// Output classes.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Dropout probability after each hidden layer.
    #[serde(default)]
    pub dropout: f32,
}

fn default_input_size() -> usize {
    16
}
fn default_hidden_size() -> usize {
    64
}
fn default_hidden_layers() -> usize {
    1
}
fn default_num_classes() -> usize {
    10
}

impl Default for SimpleMlpConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            hidden_size: default_hidden_size(),
            hidden_layers: default_hidden_layers(),
            num_classes: default_num_classes(),
            dropout: 0.0,
        }
    }
}

impl SimpleMlpConfig {
    /// Validate the architecture.
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.hidden_size == 0 || self.num_classes == 0 {
            return Err(ContinualError::Config(
                "model.input_size, model.hidden_size and model.num_classes must be > 0".into(),
            ));
        }
        if self.hidden_layers == 0 {
            return Err(ContinualError::Config(
                "model.hidden_layers must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ContinualError::Config(format!(
                "model.dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Multi-layer perceptron: `features.i` (Linear + ReLU + dropout) then `classifier`.
pub struct SimpleMlp {
    config: SimpleMlpConfig,
    features: Vec<Linear>,
    classifier: Linear,
    var_map: VarMap,
    device: Device,
}

impl SimpleMlp {
    /// Create a freshly initialized model on `device`.
    pub fn new(config: &SimpleMlpConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let mut features = Vec::with_capacity(config.hidden_layers);
        let mut in_dim = config.input_size;
        for i in 0..config.hidden_layers {
            features.push(candle_nn::linear(
                in_dim,
                config.hidden_size,
                vb.pp(format!("features.{i}")),
            )?);
            in_dim = config.hidden_size;
        }
        let classifier = candle_nn::linear(in_dim, config.num_classes, vb.pp("classifier"))?;

        Ok(Self {
            config: config.clone(),
            features,
            classifier,
            var_map,
            device: device.clone(),
        })
    }

    /// Architecture this model was built from.
    #[must_use]
    pub fn config(&self) -> &SimpleMlpConfig {
        &self.config
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}

impl ContinualModel for SimpleMlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut hidden = xs.clone();
        for layer in &self.features {
            hidden = layer.forward(&hidden)?.relu()?;
            if train && self.config.dropout > 0.0 {
                hidden = candle_nn::ops::dropout(&hidden, self.config.dropout)?;
            }
        }
        self.classifier.forward(&hidden)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn layer_names(&self) -> Vec<String> {
        (0..self.features.len())
            .map(|i| format!("features.{i}"))
            .chain(std::iter::once("classifier".to_string()))
            .collect()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn lock_vars(var_map: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    var_map
        .data()
        .lock()
        .map_err(|_| ContinualError::Model("parameter map lock poisoned".into()))
}

/// Weight and bias of one linear layer.
#[derive(Debug, Clone)]
pub struct LayerParams {
    /// Layer name.
    pub name: String,
    /// Weight: (out_features, in_features)
    pub weight: Var,
    /// Bias: (out_features,)
    pub bias: Option<Var>,
}

impl LayerParams {
    /// Output width.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Input width.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Fully qualified names of this layer's parameters.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = vec![format!("{}.weight", self.name)];
        if self.bias.is_some() {
            names.push(format!("{}.bias", self.name));
        }
        names
    }
}

/// Look up the parameters of linear layer `layer`.
pub fn layer_params(model: &dyn ContinualModel, layer: &str) -> Result<LayerParams> {
    let data = lock_vars(model.var_map())?;
    let weight = data
        .get(&format!("{layer}.weight"))
        .cloned()
        .ok_or_else(|| ContinualError::Model(format!("model has no layer named `{layer}`")))?;
    if weight.rank() != 2 {
        return Err(ContinualError::Model(format!(
            "layer `{layer}` is not a linear layer (weight shape {:?})",
            weight.dims()
        )));
    }
    let bias = data.get(&format!("{layer}.bias")).cloned();
    Ok(LayerParams {
        name: layer.to_string(),
        weight,
        bias,
    })
}

/// Every parameter as `(name, var)`, ordered by layer then weight/bias.
///
/// Parameters not covered by [`ContinualModel::layer_names`] come last, sorted
/// by name.
pub fn named_parameters(model: &dyn ContinualModel) -> Result<Vec<(String, Var)>> {
    let data = lock_vars(model.var_map())?;
    let mut remaining: Vec<&String> = data.keys().collect();
    remaining.sort();

    let mut ordered = Vec::with_capacity(data.len());
    for layer in model.layer_names() {
        for suffix in ["weight", "bias"] {
            let name = format!("{layer}.{suffix}");
            if let Some(var) = data.get(&name) {
                remaining.retain(|n| **n != name);
                ordered.push((name, var.clone()));
            }
        }
    }
    for name in remaining {
        ordered.push((name.clone(), data[name].clone()));
    }
    Ok(ordered)
}

/// Parameter names in the order of [`named_parameters`].
pub fn parameter_names(model: &dyn ContinualModel) -> Result<Vec<String>> {
    Ok(named_parameters(model)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// Re-initialize a linear layer with `U(-1/√fan_in, 1/√fan_in)` drawn from `rng`.
pub fn reinit_linear<R: Rng + ?Sized>(params: &LayerParams, rng: &mut R) -> Result<()> {
    let bound = (1.0 / (params.in_features() as f64).sqrt()) as f32;
    let uniform = Uniform::new_inclusive(-bound, bound);

    params.weight.set(&uniform_like(&params.weight, &uniform, rng)?)?;
    if let Some(bias) = &params.bias {
        bias.set(&uniform_like(bias, &uniform, rng)?)?;
    }
    Ok(())
}

fn uniform_like<R: Rng + ?Sized>(var: &Var, uniform: &Uniform<f32>, rng: &mut R) -> Result<Tensor> {
    let values: Vec<f32> = (0..var.elem_count()).map(|_| uniform.sample(rng)).collect();
    Ok(Tensor::from_vec(values, var.dims(), var.device())?.to_dtype(var.dtype())?)
}

/// Detached copy of a linear layer's weights.
#[derive(Debug, Clone)]
pub struct LayerSnapshot {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl LayerSnapshot {
    /// Copy the current values of `params`.
    pub fn capture(params: &LayerParams) -> Result<Self> {
        let weight = params.weight.as_tensor().copy()?;
        let bias = match &params.bias {
            Some(bias) => Some(bias.as_tensor().copy()?),
            None => None,
        };
        Ok(Self { weight, bias })
    }

    /// Write the snapshot back into `params`.
    pub fn restore(&self, params: &LayerParams) -> Result<()> {
        if self.weight.dims() != params.weight.dims() {
            return Err(ContinualError::Model(format!(
                "cannot restore {:?} weights into layer `{}` of shape {:?}",
                self.weight.dims(),
                params.name,
                params.weight.dims()
            )));
        }
        params.weight.set(&self.weight)?;
        if let (Some(saved), Some(bias)) = (&self.bias, &params.bias) {
            bias.set(saved)?;
        }
        Ok(())
    }

    /// Saved weight.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Saved bias.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

/// Save every parameter to a safetensors file.
pub fn save_weights<P: AsRef<Path>>(model: &dyn ContinualModel, path: P) -> Result<()> {
    model.var_map().save(path)?;
    Ok(())
}

/// Load parameters saved by [`save_weights`] into `model`.
///
/// # Errors
///
/// Returns an error if a parameter of the model is missing from the file or has
/// a different shape.
pub fn load_weights<P: AsRef<Path>>(model: &dyn ContinualModel, path: P) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, model.device())?;
    let data = lock_vars(model.var_map())?;
    for (name, var) in data.iter() {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| ContinualError::Model(format!("checkpoint is missing `{name}`")))?;
        if tensor.dims() != var.dims() {
            return Err(ContinualError::Model(format!(
                "checkpoint `{name}` has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
        var.set(tensor)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::TempDir;

    fn tiny() -> SimpleMlp {
        let config = SimpleMlpConfig {
            input_size: 4,
            hidden_size: 8,
            hidden_layers: 2,
            num_classes: 3,
            dropout: 0.0,
        };
        SimpleMlp::new(&config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let model = tiny();
        let xs = Tensor::randn(0.0f32, 1.0, (5, 4), &Device::Cpu).unwrap();
        let logits = model.forward_t(&xs, false).unwrap();
        assert_eq!(logits.dims(), &[5, 3]);
    }

    #[test]
    fn test_layer_names() {
        let model = tiny();
        assert_eq!(
            model.layer_names(),
            vec!["features.0", "features.1", "classifier"]
        );
        // 4*8 + 8 + 8*8 + 8 + 8*3 + 3
        assert_eq!(model.parameter_count(), 139);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SimpleMlpConfig::default();
        assert!(config.validate().is_ok());
        config.dropout = 1.0;
        assert!(config.validate().is_err());
        config.dropout = 0.1;
        config.hidden_layers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layer_params_lookup() {
        let model = tiny();
        let params = layer_params(&model, "classifier").unwrap();
        assert_eq!(params.out_features(), 3);
        assert_eq!(params.in_features(), 8);
        assert_eq!(
            params.parameter_names(),
            vec!["classifier.weight", "classifier.bias"]
        );

        assert!(layer_params(&model, "head").is_err());
    }

    #[test]
    fn test_named_parameters_follow_layer_order() {
        let model = tiny();
        let names = parameter_names(&model).unwrap();
        assert_eq!(
            names,
            vec![
                "features.0.weight",
                "features.0.bias",
                "features.1.weight",
                "features.1.bias",
                "classifier.weight",
                "classifier.bias",
            ]
        );
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let model = tiny();
        let params = layer_params(&model, "classifier").unwrap();
        let snapshot = LayerSnapshot::capture(&params).unwrap();
        let before: Vec<Vec<f32>> = snapshot.weight().to_vec2().unwrap();

        params
            .weight
            .set(&Tensor::zeros((3, 8), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        // The snapshot owns its storage.
        let still: Vec<Vec<f32>> = snapshot.weight().to_vec2().unwrap();
        assert_eq!(before, still);

        snapshot.restore(&params).unwrap();
        let after: Vec<Vec<f32>> = params.weight.as_tensor().to_vec2().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_restore_rejects_other_shape() {
        let model = tiny();
        let hidden = layer_params(&model, "features.1").unwrap();
        let snapshot = LayerSnapshot::capture(&hidden).unwrap();
        let classifier = layer_params(&model, "classifier").unwrap();
        assert!(snapshot.restore(&classifier).is_err());
    }

    #[test]
    fn test_set_is_visible_to_forward() {
        let model = tiny();
        let params = layer_params(&model, "classifier").unwrap();
        params
            .weight
            .set(&Tensor::zeros((3, 8), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        params
            .bias
            .as_ref()
            .unwrap()
            .set(&Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap())
            .unwrap();

        let xs = Tensor::randn(0.0f32, 1.0, (2, 4), &Device::Cpu).unwrap();
        let logits: Vec<Vec<f32>> = model.forward_t(&xs, false).unwrap().to_vec2().unwrap();
        assert_eq!(logits, vec![vec![1.0, 2.0, 3.0], vec![1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_reinit_stays_in_bounds() {
        let model = tiny();
        let params = layer_params(&model, "classifier").unwrap();
        reinit_linear(&params, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        let bound = 1.0 / (8.0f32).sqrt();
        let weights: Vec<f32> = params.weight.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert!(weights.iter().all(|w| w.abs() <= bound));
    }

    #[test]
    fn test_reinit_is_reproducible_for_a_seed() {
        let model = tiny();
        let params = layer_params(&model, "classifier").unwrap();
        let draw = |seed: u64| -> Vec<Vec<f32>> {
            reinit_linear(&params, &mut ChaCha8Rng::seed_from_u64(seed)).unwrap();
            params.weight.as_tensor().to_vec2().unwrap()
        };

        let first = draw(11);
        assert_eq!(draw(11), first);
        assert_ne!(draw(12), first);
    }

    #[test]
    fn test_save_and_load_weights() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");

        let model = tiny();
        save_weights(&model, &path).unwrap();
        let expected: Vec<Vec<f32>> = layer_params(&model, "classifier")
            .unwrap()
            .weight
            .as_tensor()
            .to_vec2()
            .unwrap();

        let other = tiny();
        load_weights(&other, &path).unwrap();
        let loaded: Vec<Vec<f32>> = layer_params(&other, "classifier")
            .unwrap()
            .weight
            .as_tensor()
            .to_vec2()
            .unwrap();
        assert_eq!(expected, loaded);
    }
}
