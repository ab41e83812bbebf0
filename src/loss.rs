//! Loss function(s)
//!
//! Both criteria average over the batch, so an untrained classifier over `C` classes
//! scores close to `ln C`.

use crate::tensor::{Tensor, TensorError};

/// Common interface for criteria taking a batch of scores and the target class of each row
pub trait Criterion {
    fn loss(&self, input: &Tensor, targets: &[usize]) -> Result<Tensor, TensorError>;
}

/// Cross entropy between raw scores (logits) and target classes,
/// equivalent to `NLLLoss` applied to the log softmax of the scores
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn call(logits: &Tensor, targets: &[usize]) -> Result<Tensor, TensorError> {
        logits.log_softmax().nll_loss(targets)
    }
}

impl Criterion for CrossEntropyLoss {
    fn loss(&self, input: &Tensor, targets: &[usize]) -> Result<Tensor, TensorError> {
        Self::call(input, targets)
    }
}

/// Negative log likelihood of target classes given log probabilities
pub struct NLLLoss;

impl NLLLoss {
    pub fn call(log_probs: &Tensor, targets: &[usize]) -> Result<Tensor, TensorError> {
        log_probs.nll_loss(targets)
    }
}

impl Criterion for NLLLoss {
    fn loss(&self, input: &Tensor, targets: &[usize]) -> Result<Tensor, TensorError> {
        Self::call(input, targets)
    }
}
