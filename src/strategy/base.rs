//! The plugin-driven training and evaluation loop.

use std::collections::BTreeSet;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::criterion::Criterion;
use crate::dataset::{Batch, TensorDataset};
use crate::error::{ContinualError, Result};
use crate::evaluation::{count_correct, EvalProtocol};
use crate::model::{self, ContinualModel};
use crate::optimizer::StrategyOptimizer;
use crate::plugins::StrategyPlugin;
use crate::scenario::Experience;

/// Identity of the experience being trained on or evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperienceInfo {
    /// Position in the stream.
    pub index: usize,
    /// Task label.
    pub task_label: usize,
    /// Classes of the experience.
    pub classes: Vec<u32>,
}

impl From<&Experience> for ExperienceInfo {
    fn from(experience: &Experience) -> Self {
        Self {
            index: experience.index,
            task_label: experience.task_label,
            classes: experience.classes.clone(),
        }
    }
}

/// Everything a plugin can see and change while the loop runs.
///
/// Per-iteration values (`batch`, `logits`, `loss`, `grads`) are `None` outside
/// the phase that produces them.
pub struct StrategyState {
    model: Box<dyn ContinualModel>,
    optimizer: StrategyOptimizer,
    criterion: Box<dyn Criterion>,
    config: StrategyConfig,
    device: Device,
    frozen: BTreeSet<String>,

    /// Training experiences completed so far.
    pub train_exp_counter: usize,
    /// Current epoch within the experience.
    pub epoch: usize,
    /// Current minibatch within the epoch (or test experience).
    pub mb_iteration: usize,
    /// Optimizer steps taken over the strategy's lifetime.
    pub global_step: usize,
    /// Whether the loop is training (as opposed to testing).
    pub is_training: bool,
    /// Experience being processed.
    pub experience: Option<ExperienceInfo>,
    /// Dataset of the experience being processed.
    pub dataset: Option<TensorDataset>,
    /// Current minibatch, already on the strategy device.
    pub batch: Option<Batch>,
    /// Logits of the current minibatch.
    pub logits: Option<Tensor>,
    /// Loss of the current minibatch.
    pub loss: Option<Tensor>,
    /// Gradients of the current minibatch.
    pub grads: Option<GradStore>,
}

impl StrategyState {
    pub(crate) fn new(
        model: Box<dyn ContinualModel>,
        optimizer: StrategyOptimizer,
        criterion: Box<dyn Criterion>,
        config: StrategyConfig,
        device: Device,
    ) -> Self {
        Self {
            model,
            optimizer,
            criterion,
            config,
            device,
            frozen: BTreeSet::new(),
            train_exp_counter: 0,
            epoch: 0,
            mb_iteration: 0,
            global_step: 0,
            is_training: false,
            experience: None,
            dataset: None,
            batch: None,
            logits: None,
            loss: None,
            grads: None,
        }
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &dyn ContinualModel {
        self.model.as_ref()
    }

    /// The optimizer.
    #[must_use]
    pub fn optimizer(&self) -> &StrategyOptimizer {
        &self.optimizer
    }

    /// The optimizer, mutably.
    pub fn optimizer_mut(&mut self) -> &mut StrategyOptimizer {
        &mut self.optimizer
    }

    /// The loss criterion.
    #[must_use]
    pub fn criterion(&self) -> &dyn Criterion {
        self.criterion.as_ref()
    }

    /// Loop configuration.
    #[must_use]
    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Device minibatches are moved to.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Names of frozen parameters.
    #[must_use]
    pub fn frozen(&self) -> &BTreeSet<String> {
        &self.frozen
    }

    /// Whether parameter `name` is frozen.
    #[must_use]
    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen.contains(name)
    }

    /// Exclude parameters from optimization and rebuild the optimizer.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is not a parameter of the model. Nothing is
    /// frozen in that case.
    pub fn freeze<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let known = model::parameter_names(self.model())?;
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if let Some(unknown) = names.iter().find(|name| !known.contains(*name)) {
            return Err(ContinualError::Model(format!(
                "cannot freeze unknown parameter `{unknown}`"
            )));
        }
        self.frozen.extend(names);
        self.reset_optimizer()
    }

    /// Freeze every parameter of `layer`.
    pub fn freeze_layer(&mut self, layer: &str) -> Result<()> {
        let params = model::layer_params(self.model(), layer)?;
        self.freeze(params.parameter_names())
    }

    /// Make every parameter trainable again.
    pub fn unfreeze_all(&mut self) -> Result<()> {
        self.frozen.clear();
        self.reset_optimizer()
    }

    /// Parameters that are not frozen, in model order.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        Ok(model::named_parameters(self.model())?
            .into_iter()
            .filter(|(name, _)| !self.frozen.contains(name))
            .map(|(_, var)| var)
            .collect())
    }

    /// Rebuild the optimizer over the trainable parameters.
    pub fn reset_optimizer(&mut self) -> Result<()> {
        let vars = self.trainable_vars()?;
        self.optimizer.reset(vars)
    }

    fn current_batch(&self) -> Result<Batch> {
        self.batch
            .clone()
            .ok_or_else(|| ContinualError::Training("a plugin removed the current minibatch".into()))
    }

    fn current_logits(&self) -> Result<Tensor> {
        self.logits
            .clone()
            .ok_or_else(|| ContinualError::Training("a plugin removed the current logits".into()))
    }

    fn current_dataset(&self) -> Result<TensorDataset> {
        self.dataset
            .clone()
            .ok_or_else(|| ContinualError::Training("a plugin removed the current dataset".into()))
    }

    fn clear_iteration(&mut self) {
        self.batch = None;
        self.logits = None;
        self.loss = None;
        self.grads = None;
    }

    fn abort_phase(&mut self) {
        self.clear_iteration();
        self.is_training = false;
        self.dataset = None;
    }
}

impl std::fmt::Debug for StrategyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyState")
            .field("layers", &self.model.layer_names())
            .field("optimizer", &self.optimizer)
            .field("config", &self.config)
            .field("frozen", &self.frozen)
            .field("train_exp_counter", &self.train_exp_counter)
            .field("global_step", &self.global_step)
            .field("is_training", &self.is_training)
            .field("experience", &self.experience)
            .finish_non_exhaustive()
    }
}

/// Outcome of training on one experience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    /// Experience index.
    pub experience: usize,
    /// Its task label.
    pub task_label: usize,
    /// Optimizer steps taken.
    pub iterations: usize,
    /// Sample-weighted mean loss of every epoch.
    pub epoch_losses: Vec<f32>,
}

impl TrainSummary {
    /// Loss of the last epoch.
    #[must_use]
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Accuracy and loss on one test experience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceResult {
    /// Experience index.
    pub experience: usize,
    /// Its task label.
    pub task_label: usize,
    /// Fraction of correct predictions.
    pub accuracy: f64,
    /// Sample-weighted mean loss.
    pub loss: f64,
}

fn scalar_loss(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?)
}

/// Generic continual-learning strategy: a training loop over experiences with
/// plugin hooks at every step.
///
/// # Example
///
/// ```rust
/// use candle_core::Device;
/// use continual_rs::criterion::CrossEntropyLoss;
/// use continual_rs::model::{ContinualModel, SimpleMlp, SimpleMlpConfig};
/// use continual_rs::optimizer::OptimizerConfig;
/// use continual_rs::strategy::BaseStrategy;
/// use continual_rs::StrategyConfig;
///
/// # fn main() -> continual_rs::Result<()> {
/// let model = SimpleMlp::new(&SimpleMlpConfig::default(), &Device::Cpu)?;
/// let optimizer = OptimizerConfig::sgd(0.1).build(model.var_map().all_vars())?;
///
/// let strategy = BaseStrategy::new(
///     model,
///     CrossEntropyLoss,
///     optimizer,
///     None,
///     StrategyConfig::default(),
///     None,
/// )?;
/// assert!(strategy.plugin_names().is_empty());
/// # Ok(())
/// # }
/// ```
pub struct BaseStrategy {
    state: StrategyState,
    plugins: Vec<Box<dyn StrategyPlugin>>,
    evaluation: Option<EvalProtocol>,
    rng: ChaCha8Rng,
}

impl BaseStrategy {
    /// Create a strategy.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the configured
    /// device is not the device the model lives on.
    pub fn new<M, C>(
        model: M,
        criterion: C,
        optimizer: StrategyOptimizer,
        evaluation_protocol: Option<EvalProtocol>,
        config: StrategyConfig,
        plugins: Option<Vec<Box<dyn StrategyPlugin>>>,
    ) -> Result<Self>
    where
        M: ContinualModel + 'static,
        C: Criterion + 'static,
    {
        config.validate()?;

        if let Some(setting) = &config.device {
            let requested = setting.resolve()?.location();
            let actual = model.device().location();
            if requested != actual {
                return Err(ContinualError::Config(format!(
                    "model lives on {actual:?} but the strategy is configured for {requested:?}"
                )));
            }
        }
        let device = model.device().clone();

        let plugins = plugins.unwrap_or_default();
        tracing::debug!(
            "Created strategy: {} layers, {} plugins, train_mb_size={}, train_epochs={}",
            model.layer_names().len(),
            plugins.len(),
            config.train_mb_size,
            config.train_epochs
        );

        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            state: StrategyState::new(
                Box::new(model),
                optimizer,
                Box::new(criterion),
                config,
                device,
            ),
            plugins,
            evaluation: evaluation_protocol,
            rng,
        })
    }

    /// Loop configuration.
    #[must_use]
    pub fn config(&self) -> &StrategyConfig {
        &self.state.config
    }

    /// Loop state.
    #[must_use]
    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    /// Loop state, mutably.
    pub fn state_mut(&mut self) -> &mut StrategyState {
        &mut self.state
    }

    /// The model.
    #[must_use]
    pub fn model(&self) -> &dyn ContinualModel {
        self.state.model()
    }

    /// The optimizer.
    #[must_use]
    pub fn optimizer(&self) -> &StrategyOptimizer {
        &self.state.optimizer
    }

    /// The plugin sequence.
    #[must_use]
    pub fn plugins(&self) -> &[Box<dyn StrategyPlugin>] {
        &self.plugins
    }

    /// Plugin names, in execution order.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// The evaluation protocol, if any.
    #[must_use]
    pub fn evaluation_protocol(&self) -> Option<&EvalProtocol> {
        self.evaluation.as_ref()
    }

    /// Save the model parameters to a safetensors file.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        model::save_weights(self.state.model(), path)
    }

    fn dispatch<F>(&mut self, mut hook: F) -> Result<()>
    where
        F: FnMut(&mut dyn StrategyPlugin, &mut StrategyState) -> Result<()>,
    {
        for plugin in &mut self.plugins {
            hook(plugin.as_mut(), &mut self.state)?;
        }
        Ok(())
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        if !self.state.config.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }

    /// Train on one experience.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a plugin, the model, the criterion or
    /// the optimizer. Training on an empty experience, or with every parameter
    /// frozen, is an error raised before `before_training_exp`. After any error
    /// the state is back out of training and holds no dataset.
    pub fn train(&mut self, experience: &Experience) -> Result<TrainSummary> {
        let result = self.train_experience(experience);
        if result.is_err() {
            self.state.abort_phase();
        }
        result
    }

    fn train_experience(&mut self, experience: &Experience) -> Result<TrainSummary> {
        let info = ExperienceInfo::from(experience);
        tracing::info!(
            "Training on experience {} (task {}, classes {:?}, {} samples)",
            info.index,
            info.task_label,
            info.classes,
            experience.train.len()
        );

        self.state.is_training = true;
        self.state.experience = Some(info.clone());
        self.state.dataset = Some(experience.train.clone());
        self.state.epoch = 0;
        self.state.mb_iteration = 0;

        self.dispatch(|p, s| p.before_training(s))?;
        self.dispatch(|p, s| p.adapt_train_dataset(s))?;

        if self.state.current_dataset()?.is_empty() {
            return Err(ContinualError::Training(format!(
                "experience {} has no training samples",
                info.index
            )));
        }
        if self.state.optimizer.num_params() == 0 {
            return Err(ContinualError::Training(
                "no trainable parameters left".into(),
            ));
        }

        self.dispatch(|p, s| p.before_training_exp(s))?;
        let dataset = self.state.current_dataset()?;

        let epochs = self.state.config.train_epochs;
        let mb_size = self.state.config.train_mb_size;
        let batches_per_epoch = dataset.len().div_ceil(mb_size);
        let pb = self.progress_bar(epochs * batches_per_epoch)?;

        let mut epoch_losses = Vec::with_capacity(epochs);
        let mut iterations = 0;
        for epoch in 0..epochs {
            self.state.epoch = epoch;
            self.dispatch(|p, s| p.before_training_epoch(s))?;

            let order = if self.state.config.shuffle {
                Some(dataset.shuffled_order(&mut self.rng))
            } else {
                None
            };

            let mut loss_sum = 0.0f64;
            let mut samples = 0usize;
            for (i, batch) in dataset.minibatches(mb_size, order)?.enumerate() {
                self.state.mb_iteration = i;
                self.state.batch = Some(batch?.to_device(&self.state.device)?);
                self.dispatch(|p, s| p.before_training_iteration(s))?;

                self.dispatch(|p, s| p.before_forward(s))?;
                let batch = self.state.current_batch()?;
                self.state.logits = Some(self.state.model.forward_t(&batch.inputs, true)?);
                self.dispatch(|p, s| p.after_forward(s))?;

                let logits = self.state.current_logits()?;
                self.state.loss = Some(self.state.criterion.loss(&logits, &batch.targets)?);
                self.dispatch(|p, s| p.before_backward(s))?;

                let loss = self.state.loss.clone().ok_or_else(|| {
                    ContinualError::Training("a plugin removed the current loss".into())
                })?;
                self.state.grads = Some(loss.backward()?);
                self.dispatch(|p, s| p.after_backward(s))?;

                self.dispatch(|p, s| p.before_update(s))?;
                if let Some(grads) = &self.state.grads {
                    self.state.optimizer.step(grads)?;
                }
                self.dispatch(|p, s| p.after_update(s))?;

                let loss_value = scalar_loss(&loss)?;
                loss_sum += f64::from(loss_value) * batch.len() as f64;
                samples += batch.len();
                iterations += 1;
                self.state.global_step += 1;

                pb.set_message(format!("{loss_value:.4}"));
                pb.inc(1);
                if self.state.global_step % self.state.config.logging_steps == 0 {
                    tracing::debug!(
                        "Step {}, Experience {}, Epoch {}, Loss: {:.4}, LR: {:.2e}",
                        self.state.global_step,
                        info.index,
                        epoch + 1,
                        loss_value,
                        self.state.optimizer.learning_rate()
                    );
                }

                self.dispatch(|p, s| p.after_training_iteration(s))?;
                self.state.clear_iteration();
            }

            let epoch_loss = if samples == 0 {
                0.0
            } else {
                (loss_sum / samples as f64) as f32
            };
            tracing::info!(
                "Experience {} | epoch {}/{} | loss {:.4}",
                info.index,
                epoch + 1,
                epochs,
                epoch_loss
            );
            epoch_losses.push(epoch_loss);
            self.dispatch(|p, s| p.after_training_epoch(s))?;
        }

        self.dispatch(|p, s| p.after_training_exp(s))?;
        self.state.train_exp_counter += 1;
        self.dispatch(|p, s| p.after_training(s))?;

        pb.finish_with_message("done");
        self.state.is_training = false;
        self.state.dataset = None;

        Ok(TrainSummary {
            experience: info.index,
            task_label: info.task_label,
            iterations,
            epoch_losses,
        })
    }

    /// Train on every experience of a stream, in order.
    pub fn train_stream(&mut self, experiences: &[Experience]) -> Result<Vec<TrainSummary>> {
        experiences.iter().map(|e| self.train(e)).collect()
    }

    /// Evaluate on every experience of a stream.
    ///
    /// Accuracy and loss are always computed; the evaluation protocol, when
    /// present, records its own metrics for every experience.
    pub fn test(&mut self, experiences: &[Experience]) -> Result<Vec<ExperienceResult>> {
        let result = self.evaluate_stream(experiences);
        if result.is_err() {
            self.state.abort_phase();
        }
        result
    }

    fn evaluate_stream(&mut self, experiences: &[Experience]) -> Result<Vec<ExperienceResult>> {
        self.state.is_training = false;
        self.dispatch(|p, s| p.before_test(s))?;

        let mb_size = self.state.config.test_mb_size();
        let mut results = Vec::with_capacity(experiences.len());
        for experience in experiences {
            let info = ExperienceInfo::from(experience);
            self.state.experience = Some(info.clone());
            self.state.dataset = Some(experience.test.clone());
            self.dispatch(|p, s| p.adapt_test_dataset(s))?;
            self.dispatch(|p, s| p.before_test_exp(s))?;

            let dataset = self.state.current_dataset()?;
            if let Some(evaluation) = &mut self.evaluation {
                evaluation.begin_experience();
            }

            let mut correct = 0usize;
            let mut total = 0usize;
            let mut loss_sum = 0.0f64;
            for (i, batch) in dataset.minibatches(mb_size, None)?.enumerate() {
                self.state.mb_iteration = i;
                self.state.batch = Some(batch?.to_device(&self.state.device)?);
                self.dispatch(|p, s| p.before_test_iteration(s))?;

                self.dispatch(|p, s| p.before_test_forward(s))?;
                let batch = self.state.current_batch()?;
                self.state.logits = Some(self.state.model.forward_t(&batch.inputs, false)?);
                self.dispatch(|p, s| p.after_test_forward(s))?;

                let logits = self.state.current_logits()?;
                let loss = self.state.criterion.loss(&logits, &batch.targets)?;
                let loss_value = scalar_loss(&loss)?;
                self.state.loss = Some(loss);

                let (batch_correct, batch_total) = count_correct(&logits, &batch.targets)?;
                correct += batch_correct;
                total += batch_total;
                loss_sum += f64::from(loss_value) * batch_total as f64;
                if let Some(evaluation) = &mut self.evaluation {
                    evaluation.update(&logits, &batch.targets, loss_value)?;
                }

                self.dispatch(|p, s| p.after_test_iteration(s))?;
                self.state.clear_iteration();
            }

            if let Some(evaluation) = &mut self.evaluation {
                evaluation.finish_experience(
                    self.state.train_exp_counter,
                    info.index,
                    info.task_label,
                );
            }

            let (accuracy, loss) = if total == 0 {
                (0.0, 0.0)
            } else {
                (correct as f64 / total as f64, loss_sum / total as f64)
            };
            tracing::info!(
                "Test experience {} (task {}) | accuracy {:.4} | loss {:.4}",
                info.index,
                info.task_label,
                accuracy,
                loss
            );
            self.dispatch(|p, s| p.after_test_exp(s))?;

            results.push(ExperienceResult {
                experience: info.index,
                task_label: info.task_label,
                accuracy,
                loss,
            });
        }

        self.dispatch(|p, s| p.after_test(s))?;
        self.state.dataset = None;
        Ok(results)
    }
}

impl std::fmt::Debug for BaseStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseStrategy")
            .field("state", &self.state)
            .field("plugins", &self.plugin_names())
            .field("evaluation", &self.evaluation)
            .finish()
    }
}
