//! Optimizers (SGD, AdamW) over the trainable parameters of a strategy.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::error::{ContinualError, Result};

/// Optimizer family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent.
    #[default]
    Sgd,
    /// Adam with decoupled weight decay.
    Adamw,
}

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Optimizer family
    #[serde(default)]
    pub kind: OptimizerKind,
    /// Learning rate
    #[serde(default = "default_lr")]
    pub learning_rate: f64,
    /// Beta1 for AdamW
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    /// Beta2 for AdamW
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Epsilon for numerical stability
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Weight decay (AdamW only)
    #[serde(default)]
    pub weight_decay: f64,
}

fn default_lr() -> f64 {
    0.01
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            learning_rate: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// SGD with the given learning rate.
    #[must_use]
    pub fn sgd(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Default::default()
        }
    }

    /// AdamW with the given learning rate.
    #[must_use]
    pub fn adamw(learning_rate: f64) -> Self {
        Self {
            kind: OptimizerKind::Adamw,
            learning_rate,
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(ContinualError::Config(format!(
                "optimizer.learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(ContinualError::Config(
                "optimizer betas must be in [0, 1)".into(),
            ));
        }
        if self.weight_decay < 0.0 {
            return Err(ContinualError::Config(
                "optimizer.weight_decay must be >= 0".into(),
            ));
        }
        Ok(())
    }

    /// Build an optimizer over `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(&self, vars: Vec<Var>) -> Result<StrategyOptimizer> {
        let num_params = vars.len();
        let inner = match self.kind {
            OptimizerKind::Sgd => {
                let opt = candle_nn::SGD::new(vars, self.learning_rate)
                    .map_err(|e| ContinualError::Training(format!("Failed to create SGD: {e}")))?;
                Inner::Sgd(opt)
            }
            OptimizerKind::Adamw => {
                let params = ParamsAdamW {
                    lr: self.learning_rate,
                    beta1: self.beta1,
                    beta2: self.beta2,
                    eps: self.eps,
                    weight_decay: self.weight_decay,
                };
                let opt = candle_nn::AdamW::new(vars, params)
                    .map_err(|e| ContinualError::Training(format!("Failed to create AdamW: {e}")))?;
                Inner::AdamW(opt)
            }
        };

        Ok(StrategyOptimizer {
            config: self.clone(),
            inner,
            num_params,
        })
    }
}

enum Inner {
    Sgd(candle_nn::SGD),
    AdamW(candle_nn::AdamW),
}

/// Optimizer owned by a strategy.
///
/// The parameter set is fixed at construction; [`StrategyOptimizer::reset`]
/// rebuilds it over a new set when layers are frozen or heads are swapped.
pub struct StrategyOptimizer {
    config: OptimizerConfig,
    inner: Inner,
    num_params: usize,
}

impl StrategyOptimizer {
    /// Apply one update from `grads`. Parameters without a gradient are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let res = match &mut self.inner {
            Inner::Sgd(opt) => opt.step(grads),
            Inner::AdamW(opt) => opt.step(grads),
        };
        res.map_err(|e| ContinualError::Training(format!("Optimizer step failed: {e}")))
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match &self.inner {
            Inner::Sgd(opt) => opt.learning_rate(),
            Inner::AdamW(opt) => opt.learning_rate(),
        }
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.inner {
            Inner::Sgd(opt) => opt.set_learning_rate(lr),
            Inner::AdamW(opt) => opt.set_learning_rate(lr),
        }
    }

    /// Rebuild over `vars`, keeping the current learning rate and dropping any
    /// moment estimates.
    pub fn reset(&mut self, vars: Vec<Var>) -> Result<()> {
        let mut config = self.config.clone();
        config.learning_rate = self.learning_rate();
        *self = config.build(vars)?;
        Ok(())
    }

    /// Number of parameter tensors being optimized.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Configuration this optimizer was built from.
    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

impl std::fmt::Debug for StrategyOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyOptimizer")
            .field("kind", &self.config.kind)
            .field("learning_rate", &self.learning_rate())
            .field("num_params", &self.num_params)
            .finish()
    }
}
