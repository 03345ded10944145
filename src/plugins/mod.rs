//! Plugins hooked into the base training loop.
//!
//! A plugin overrides the hooks it cares about; every other hook is a no-op.
//! Plugins run in the order of the strategy's plugin sequence and the first
//! error aborts the loop.
//!
//! ```text
//! train:  before_training, adapt_train_dataset, before_training_exp,
//!         { before_training_epoch,
//!           { before_training_iteration, before_forward, after_forward,
//!             before_backward, after_backward, before_update, after_update,
//!             after_training_iteration }*
//!           after_training_epoch }*
//!         after_training_exp, after_training
//! test:   before_test,
//!         { adapt_test_dataset, before_test_exp,
//!           { before_test_iteration, before_test_forward, after_test_forward,
//!             after_test_iteration }*
//!           after_test_exp }*
//!         after_test
//! ```

mod cwr_star;
mod multi_head;

pub use cwr_star::CwrStarPlugin;
pub use multi_head::MultiHeadPlugin;

use crate::error::Result;
use crate::strategy::StrategyState;

macro_rules! hooks {
    ($($(#[$doc:meta])* $hook:ident),* $(,)?) => {
        /// Callbacks invoked by [`BaseStrategy`](crate::strategy::BaseStrategy).
        ///
        /// # Example
        ///
        /// ```rust
        /// use continual_rs::plugins::StrategyPlugin;
        /// use continual_rs::strategy::StrategyState;
        ///
        /// struct EpochCounter(usize);
        ///
        /// impl StrategyPlugin for EpochCounter {
        ///     fn name(&self) -> &str {
        ///         "epoch_counter"
        ///     }
        ///
        ///     fn after_training_epoch(&mut self, _state: &mut StrategyState) -> continual_rs::Result<()> {
        ///         self.0 += 1;
        ///         Ok(())
        ///     }
        /// }
        /// ```
        pub trait StrategyPlugin: Send {
            /// Identifier used in logs and errors.
            fn name(&self) -> &str;

            $(
                $(#[$doc])*
                fn $hook(&mut self, state: &mut StrategyState) -> Result<()> {
                    let _ = state;
                    Ok(())
                }
            )*
        }
    };
}

hooks! {
    /// Once per call to `train`, before anything else.
    before_training,
    /// May replace `state.dataset` before the experience is trained on.
    adapt_train_dataset,
    /// Before the first epoch of an experience.
    before_training_exp,
    /// Start of every epoch.
    before_training_epoch,
    /// A fresh minibatch is in `state.batch`.
    before_training_iteration,
    /// Right before the training forward pass.
    before_forward,
    /// `state.logits` holds the training logits.
    after_forward,
    /// `state.loss` holds the minibatch loss.
    before_backward,
    /// `state.grads` holds the gradients.
    after_backward,
    /// Between the backward pass and the optimizer step.
    before_update,
    /// After the optimizer step.
    after_update,
    /// End of every training iteration.
    after_training_iteration,
    /// End of every epoch.
    after_training_epoch,
    /// After the last epoch, before `train_exp_counter` is incremented.
    after_training_exp,
    /// Once per call to `train`, after everything else.
    after_training,
    /// Once per call to `test`.
    before_test,
    /// May replace `state.dataset` before the experience is evaluated.
    adapt_test_dataset,
    /// Before an experience is evaluated.
    before_test_exp,
    /// A fresh test minibatch is in `state.batch`.
    before_test_iteration,
    /// Right before the evaluation forward pass.
    before_test_forward,
    /// `state.logits` holds the evaluation logits.
    after_test_forward,
    /// End of every test iteration.
    after_test_iteration,
    /// After an experience has been evaluated.
    after_test_exp,
    /// Once per call to `test`, after everything else.
    after_test,
}
