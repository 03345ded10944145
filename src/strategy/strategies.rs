//! Naive, multi-head and CWR* strategies.

use std::ops::{Deref, DerefMut};

use crate::config::{default_classifier_field, default_cwr_classes, StrategyConfig};
use crate::criterion::Criterion;
use crate::error::Result;
use crate::evaluation::EvalProtocol;
use crate::model::ContinualModel;
use crate::optimizer::StrategyOptimizer;
use crate::plugins::{CwrStarPlugin, MultiHeadPlugin, StrategyPlugin};
use crate::strategy::BaseStrategy;

/// Append `plugin` to the caller's plugins, or start a new sequence with it.
///
/// The caller's plugins keep their order and `plugin` always ends up last.
#[must_use]
pub fn compose_plugins(
    plugins: Option<Vec<Box<dyn StrategyPlugin>>>,
    plugin: Box<dyn StrategyPlugin>,
) -> Vec<Box<dyn StrategyPlugin>> {
    let mut composed = plugins.unwrap_or_default();
    composed.push(plugin);
    composed
}

macro_rules! deref_base {
    ($strategy:ty) => {
        impl Deref for $strategy {
            type Target = BaseStrategy;

            fn deref(&self) -> &BaseStrategy {
                &self.base
            }
        }

        impl DerefMut for $strategy {
            fn deref_mut(&mut self) -> &mut BaseStrategy {
                &mut self.base
            }
        }

        impl $strategy {
            /// Unwrap the base strategy.
            #[must_use]
            pub fn into_inner(self) -> BaseStrategy {
                self.base
            }
        }
    };
}

/// Fine-tuning with no protection against forgetting.
///
/// Everything is passed unchanged to [`BaseStrategy::new`].
#[derive(Debug)]
pub struct Naive {
    base: BaseStrategy,
}

impl Naive {
    /// Create the strategy.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`BaseStrategy::new`].
    pub fn new<M, C>(
        model: M,
        optimizer: StrategyOptimizer,
        criterion: C,
        evaluation_protocol: Option<EvalProtocol>,
        config: StrategyConfig,
        plugins: Option<Vec<Box<dyn StrategyPlugin>>>,
    ) -> Result<Self>
    where
        M: ContinualModel + 'static,
        C: Criterion + 'static,
    {
        let base = BaseStrategy::new(
            model,
            criterion,
            optimizer,
            evaluation_protocol,
            config,
            plugins,
        )?;
        Ok(Self { base })
    }
}

deref_base!(Naive);

/// Settings of the head-expansion plugin added by [`MtNaive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiHeadOptions {
    /// Name of the classifier layer.
    pub classifier_field: String,
    /// Use the model's initial classifier as the head of task 0.
    pub keep_initial_layer: bool,
}

impl Default for MultiHeadOptions {
    fn default() -> Self {
        Self {
            classifier_field: default_classifier_field(),
            keep_initial_layer: false,
        }
    }
}

/// Fine-tuning with one classifier head per task label.
#[derive(Debug)]
pub struct MtNaive {
    base: BaseStrategy,
    options: MultiHeadOptions,
}

impl MtNaive {
    /// Create the strategy. A [`MultiHeadPlugin`] is appended after the
    /// caller's plugins.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`MultiHeadPlugin::new`] or
    /// [`BaseStrategy::new`].
    pub fn new<M, C>(
        model: M,
        optimizer: StrategyOptimizer,
        criterion: C,
        evaluation_protocol: Option<EvalProtocol>,
        config: StrategyConfig,
        plugins: Option<Vec<Box<dyn StrategyPlugin>>>,
        options: MultiHeadOptions,
    ) -> Result<Self>
    where
        M: ContinualModel + 'static,
        C: Criterion + 'static,
    {
        let head = MultiHeadPlugin::new(
            &model,
            options.classifier_field.clone(),
            options.keep_initial_layer,
        )?;
        let plugins = compose_plugins(plugins, Box::new(head));
        let base = BaseStrategy::new(
            model,
            criterion,
            optimizer,
            evaluation_protocol,
            config,
            Some(plugins),
        )?;
        Ok(Self { base, options })
    }

    /// Settings the head plugin was built with.
    #[must_use]
    pub fn head_options(&self) -> &MultiHeadOptions {
        &self.options
    }
}

deref_base!(MtNaive);

/// Settings of the consolidation plugin added by [`CwrStar`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CwrStarOptions {
    /// Last layer of the frozen feature extractor.
    pub second_last_layer_name: String,
    /// Total number of classes.
    pub num_classes: usize,
}

impl CwrStarOptions {
    /// Options for `second_last_layer_name` with 50 classes.
    pub fn new(second_last_layer_name: impl Into<String>) -> Self {
        Self {
            second_last_layer_name: second_last_layer_name.into(),
            num_classes: default_cwr_classes(),
        }
    }

    /// Set the total number of classes.
    #[must_use]
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }
}

/// CWR*: a frozen feature extractor after the first experience and
/// per-class consolidated classifier weights.
#[derive(Debug)]
pub struct CwrStar {
    base: BaseStrategy,
    options: CwrStarOptions,
}

impl CwrStar {
    /// Create the strategy. A [`CwrStarPlugin`] is appended after the caller's
    /// plugins.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`CwrStarPlugin::new`] or
    /// [`BaseStrategy::new`].
    pub fn new<M, C>(
        model: M,
        optimizer: StrategyOptimizer,
        criterion: C,
        evaluation_protocol: Option<EvalProtocol>,
        config: StrategyConfig,
        plugins: Option<Vec<Box<dyn StrategyPlugin>>>,
        options: CwrStarOptions,
    ) -> Result<Self>
    where
        M: ContinualModel + 'static,
        C: Criterion + 'static,
    {
        let cwr = CwrStarPlugin::new(
            &model,
            options.second_last_layer_name.clone(),
            options.num_classes,
        )?;
        let plugins = compose_plugins(plugins, Box::new(cwr));
        let base = BaseStrategy::new(
            model,
            criterion,
            optimizer,
            evaluation_protocol,
            config,
            Some(plugins),
        )?;
        Ok(Self { base, options })
    }

    /// Settings the consolidation plugin was built with.
    #[must_use]
    pub fn cwr_options(&self) -> &CwrStarOptions {
        &self.options
    }
}

deref_base!(CwrStar);
