//! # continual-rs
//!
//! Continual-learning strategies on candle, built around a plugin-driven
//! training loop.
//!
//! ## Features
//!
//! - **Naive** - plain fine-tuning over a stream of experiences
//! - **MtNaive** - fine-tuning with one classifier head per task label
//! - **CwrStar** - CWR* consolidated classifier weights over a frozen feature extractor
//! - **Plugins** - hook into every step of training and evaluation
//! - **Evaluation** - accuracy, loss and forgetting after every experience
//! - **YAML Configuration** - describe whole experiments for the `continual` binary
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starter configuration
//! continual init config.yaml --preset cwr-star-mlp
//!
//! # Validate it
//! continual validate config.yaml
//!
//! # Train on every experience and evaluate the whole stream after each
//! continual run config.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```rust
//! use candle_core::Device;
//! use continual_rs::criterion::CrossEntropyLoss;
//! use continual_rs::model::{ContinualModel, SimpleMlp, SimpleMlpConfig};
//! use continual_rs::optimizer::OptimizerConfig;
//! use continual_rs::scenario::{Scenario, SplitOptions, SyntheticBlobs};
//! use continual_rs::strategy::{CwrStar, CwrStarOptions};
//! use continual_rs::StrategyConfig;
//!
//! # fn main() -> continual_rs::Result<()> {
//! let blobs = SyntheticBlobs::new(4, 8, 4.0, 0)?;
//! let scenario = Scenario::class_incremental(
//!     blobs.sample(20, 1)?,
//!     blobs.sample(10, 2)?,
//!     2,
//!     SplitOptions::default(),
//! )?;
//!
//! let model_config = SimpleMlpConfig {
//!     input_size: 8,
//!     num_classes: 4,
//!     ..Default::default()
//! };
//! let model = SimpleMlp::new(&model_config, &Device::Cpu)?;
//! let optimizer = OptimizerConfig::sgd(0.05).build(model.var_map().all_vars())?;
//!
//! let mut strategy = CwrStar::new(
//!     model,
//!     optimizer,
//!     CrossEntropyLoss,
//!     None,
//!     StrategyConfig { train_mb_size: 8, ..Default::default() },
//!     None,
//!     CwrStarOptions::new("features.0").with_num_classes(4),
//! )?;
//!
//! for experience in scenario.experiences() {
//!     strategy.train(experience)?;
//!     strategy.test(scenario.experiences())?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Writing a Plugin
//!
//! ```rust
//! use continual_rs::plugins::StrategyPlugin;
//! use continual_rs::strategy::StrategyState;
//!
//! struct LossLogger;
//!
//! impl StrategyPlugin for LossLogger {
//!     fn name(&self) -> &str {
//!         "loss_logger"
//!     }
//!
//!     fn after_training_iteration(&mut self, state: &mut StrategyState) -> continual_rs::Result<()> {
//!         if let Some(loss) = &state.loss {
//!             println!("step {}: {}", state.global_step, loss);
//!         }
//!         Ok(())
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod criterion;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod model;
pub mod optimizer;
pub mod plugins;
pub mod scenario;
pub mod strategy;

pub use config::{ExperimentConfig, StrategyConfig};
pub use error::{ContinualError, Result};
pub use strategy::{BaseStrategy, CwrStar, MtNaive, Naive};
