//! Training loop and evaluation

use thiserror::Error;

use crate::{
    dataloader::DataLoader,
    loss::Criterion,
    nn::{Head, Module, NNError},
    optim::Optim,
    tensor::{Tensor, TensorError, no_grad},
};

/// Errors raised while training or evaluating a model
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("cannot train on an empty data loader")]
    EmptyLoader,
    #[error("model has no parameters")]
    NoParameters,
    #[error("training diverged: loss is {loss} in epoch {epoch}")]
    Diverged { epoch: usize, loss: f32 },
}

/// Settings of the training loop
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    /// Seeds the shuffling of every epoch (`seed + epoch`), shuffles from entropy when `None`
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            seed: None,
        }
    }
}

/// Runs one pass over `batches`, returning the mean batch loss.
///
/// Each batch clears the accumulated gradients first, then runs the forward pass, the loss,
/// the backward pass and a single optimizer step.
pub fn train_epoch<I>(
    model: &dyn Module,
    criterion: &dyn Criterion,
    optim: &mut dyn Optim,
    batches: I,
) -> Result<f32, TrainError>
where
    I: IntoIterator<Item = (Tensor, Vec<usize>)>,
{
    let mut running_loss = 0.0;
    let mut n_batches = 0;
    for (images, labels) in batches {
        optim.zero_grad();
        let output = model.forward(&images)?;
        let loss = criterion.loss(&output, &labels)?;
        loss.backward()?;
        optim.step();
        running_loss += loss.item()?;
        n_batches += 1;
    }
    if n_batches == 0 {
        return Err(TrainError::EmptyLoader);
    }
    Ok(running_loss / n_batches as f32)
}

/// Trains for `config.epochs` epochs and returns the mean training loss of every epoch
pub fn train(
    model: &dyn Module,
    criterion: &dyn Criterion,
    optim: &mut dyn Optim,
    loader: &DataLoader,
    config: &TrainConfig,
) -> Result<Vec<f32>, TrainError> {
    if loader.is_empty() {
        return Err(TrainError::EmptyLoader);
    }
    let mut losses = Vec::with_capacity(config.epochs);
    for epoch in 0..config.epochs {
        let loss = match config.seed {
            Some(seed) => {
                let batches = loader.seeded_iter(seed.wrapping_add(epoch as u64));
                train_epoch(model, criterion, optim, batches)?
            }
            None => train_epoch(model, criterion, optim, loader.iter())?,
        };
        if !loss.is_finite() {
            return Err(TrainError::Diverged {
                epoch: epoch + 1,
                loss,
            });
        }
        log::info!("Epoch {}/{} - Training loss: {}", epoch + 1, config.epochs, loss);
        losses.push(loss);
    }
    Ok(losses)
}

/// Class probabilities of a single flattened sample, computed without recording a graph
pub fn predict_proba(model: &dyn Module, head: Head, sample: &[f32]) -> Result<Vec<f32>, TrainError> {
    let _guard = no_grad();
    let input = Tensor::new(sample.to_vec(), [1, sample.len()])?;
    let output = model.forward(&input)?;
    let probs = match head {
        Head::Logits => output.softmax(),
        Head::LogSoftmax => output.exp(),
    };
    Ok(probs.data())
}

/// Fraction of samples whose highest scoring class matches the label
pub fn accuracy(model: &dyn Module, loader: &DataLoader) -> Result<f32, TrainError> {
    if loader.is_empty() {
        return Err(TrainError::EmptyLoader);
    }
    let _guard = no_grad();
    let mut correct = 0;
    for (images, labels) in loader.iter() {
        let predictions = model.forward(&images)?.argmax_rows();
        correct += predictions
            .iter()
            .zip(&labels)
            .filter(|(p, l)| p == l)
            .count();
    }
    Ok(correct as f32 / loader.n_samples() as f32)
}
