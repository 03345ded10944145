//! Continual-learning strategies.
//!
//! [`BaseStrategy`] owns the training loop; [`Naive`], [`MtNaive`] and
//! [`CwrStar`] are thin constructors over it that differ only in the plugins
//! they add.

mod base;
mod strategies;

pub use base::{BaseStrategy, ExperienceInfo, ExperienceResult, StrategyState, TrainSummary};
pub use strategies::{
    compose_plugins, CwrStar, CwrStarOptions, MtNaive, MultiHeadOptions, Naive,
};
