//! Loss criteria.

use candle_core::Tensor;

/// Loss between model logits and `u32` class targets.
///
/// Closures with the matching signature implement it:
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use continual_rs::criterion::Criterion;
///
/// let mse = |logits: &Tensor, _targets: &Tensor| logits.sqr()?.mean_all();
/// let logits = Tensor::new(&[[1.0f32, -1.0]], &Device::Cpu).unwrap();
/// let targets = Tensor::new(&[0u32], &Device::Cpu).unwrap();
/// let loss: f32 = mse.loss(&logits, &targets).unwrap().to_scalar().unwrap();
/// assert_eq!(loss, 1.0);
/// ```
pub trait Criterion: Send + Sync {
    /// Scalar loss for a minibatch.
    fn loss(&self, logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor>;
}

impl<F> Criterion for F
where
    F: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor> + Send + Sync,
{
    fn loss(&self, logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
        self(logits, targets)
    }
}

/// Mean softmax cross-entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl Criterion for CrossEntropyLoss {
    fn loss(&self, logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::loss::cross_entropy(logits, targets)
    }
}
