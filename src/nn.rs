//! Components to build a neural network

use std::{
    fmt::{self, Display},
    sync::atomic::{self, AtomicUsize},
};

use rand::Rng;
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected} features, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError>;

    /// One line description used when printing a model
    fn describe(&self) -> String;
}

/// Fully connected layer computing `x @ W^T + b`
pub struct Linear {
    /// `[out_features, in_features]`
    weight: Tensor,
    /// `[1, out_features]`
    bias: Tensor,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::with_rng(in_features, out_features, &mut rand::rng())
    }

    /// Weights and biases are drawn from `U(-1/sqrt(in), 1/sqrt(in))`, the default
    /// initialization of `torch.nn.Linear`
    pub fn with_rng<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        Self {
            weight: Tensor::uniform([out_features, in_features], bound, rng).requires_grad(true),
            bias: Tensor::uniform([1, out_features], bound, rng).requires_grad(true),
        }
    }

    // Testing utility for a deterministic and simple layer
    #[cfg(test)]
    fn new_ones(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Tensor::ones([out_features, in_features]).requires_grad(true),
            bias: Tensor::ones([1, out_features]).requires_grad(true),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn in_features(&self) -> usize {
        self.weight.cols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.rows()
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        if input.cols() != self.in_features() {
            return Err(NNError::InputSizeMismatch {
                expected: self.in_features(),
                got: input.cols(),
            });
        }
        let output = input.matmul(&self.weight.transpose())?;
        Ok(output.add(&self.bias)?)
    }

    fn describe(&self) -> String {
        format!(
            "Linear(in_features={}, out_features={}, bias=True)",
            self.in_features(),
            self.out_features()
        )
    }
}

/// Applies ReLU elementwise, works for arbitrary input shapes
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Returns the number of inactive outputs in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let n_dead_neurons = input.data().iter().filter(|v| **v <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        log::debug!("relu: {} of {} outputs inactive", n_dead_neurons, input.numel());
        Ok(input.relu())
    }

    fn describe(&self) -> String {
        "ReLU()".to_string()
    }
}

/// Applies log softmax over each row (`dim=1`)
#[derive(Default)]
pub struct LogSoftmax {}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {}
    }
}

impl Module for LogSoftmax {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.log_softmax())
    }

    fn describe(&self) -> String {
        "LogSoftmax(dim=1)".to_string()
    }
}

/// Applies softmax over each row (`dim=1`)
#[derive(Default)]
pub struct Softmax {}

impl Softmax {
    pub fn new() -> Self {
        Self {}
    }
}

impl Module for Softmax {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.softmax())
    }

    fn describe(&self) -> String {
        "Softmax(dim=1)".to_string()
    }
}

/// Chains modules, feeding the output of each into the next
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self { layers: vec![] }
    }

    /// Appends a module to the chain
    pub fn add<M: Module + 'static>(mut self, layer: M) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Module at position `idx` of the chain
    pub fn layer(&self, idx: usize) -> Option<&dyn Module> {
        self.layers.get(idx).map(|l| l.as_ref())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let mut current = input.clone();
        for layer in &self.layers {
            current = layer.forward(&current)?;
        }
        Ok(current)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn describe(&self) -> String {
        "Sequential".to_string()
    }
}

impl Display for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sequential(")?;
        for (i, layer) in self.layers.iter().enumerate() {
            writeln!(f, "  ({}): {}", i, layer.describe())?;
        }
        write!(f, ")")
    }
}

/// What the last layer of a multi-layer perceptron produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    /// Raw scores, to be paired with `CrossEntropyLoss`
    Logits,
    /// Log probabilities, to be paired with `NLLLoss`
    LogSoftmax,
}

/// Builds `Linear -> ReLU -> ... -> Linear` with an optional `LogSoftmax` on top
pub fn mlp<R: Rng + ?Sized>(
    n_inputs: usize,
    hidden: &[usize],
    n_outputs: usize,
    head: Head,
    rng: &mut R,
) -> Sequential {
    let mut model = Sequential::new();
    let mut n_in = n_inputs;
    for &n_hidden in hidden {
        model = model
            .add(Linear::with_rng(n_in, n_hidden, rng))
            .add(ReLU::new());
        n_in = n_hidden;
    }
    model = model.add(Linear::with_rng(n_in, n_outputs, rng));
    match head {
        Head::Logits => model,
        Head::LogSoftmax => model.add(LogSoftmax::new()),
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_linear_forward() {
        let layer = Linear::new_ones(2, 3);
        let inputs = Tensor::new(vec![1.0, 2.0], [1, 2]).unwrap();
        let outputs = layer.forward(&inputs).unwrap();
        assert_eq!(outputs.shape(), [1, 3]);
        assert_eq!(outputs.data(), vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_linear_backward() {
        let layer = Linear::new_ones(2, 1);
        let inputs = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        layer.forward(&inputs).unwrap().sum().backward().unwrap();
        // d sum / d W = column sums of the inputs, d sum / d b = batch size
        assert_eq!(layer.weight().grad().unwrap(), vec![4.0, 6.0]);
        assert_eq!(layer.bias().grad().unwrap(), vec![2.0]);
        // inputs are not tracked
        assert_eq!(inputs.grad(), None);
    }

    #[test]
    fn test_linear_init_bounds() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let layer = Linear::with_rng(16, 4, &mut rng);
        let bound = 0.25;
        assert_eq!(layer.weight().shape(), [4, 16]);
        assert_eq!(layer.bias().shape(), [1, 4]);
        assert!(layer.weight().data().iter().all(|w| w.abs() <= bound));
        assert!(layer.bias().data().iter().all(|b| b.abs() <= bound));
    }

    #[test]
    fn test_dim_mismatch() {
        let layer = Linear::new_ones(2, 3);
        let inputs = Tensor::new(vec![1.0], [1, 1]).unwrap();
        let err = layer.forward(&inputs).unwrap_err();
        assert!(matches!(
            err,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_relu_dead_neurons() {
        let relu = ReLU::new();
        let inputs = Tensor::new(vec![-1.0, 0.0, 2.0], [1, 3]).unwrap();
        let outputs = relu.forward(&inputs).unwrap();
        assert_eq!(outputs.data(), vec![0.0, 0.0, 2.0]);
        assert_eq!(relu.n_dead_neurons(), 2);
    }

    #[test]
    fn test_softmax() {
        let softmax = Softmax::new();
        let inputs = Tensor::new(vec![1.0, 2.0], [1, 2]).unwrap();
        let outputs = softmax.forward(&inputs).unwrap().data();
        assert_eq!(outputs.len(), 2);
        assert_eq_float!(outputs[0], 0.2689414);
        assert_eq_float!(outputs[1], 0.7310585);
    }

    #[test]
    fn test_mlp_structure() {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let model = mlp(784, &[128, 64], 10, Head::LogSoftmax, &mut rng);
        assert_eq!(model.len(), 6);
        // two tensors per linear layer
        assert_eq!(model.parameters().len(), 6);
        assert_eq!(
            model.to_string(),
            "Sequential(\n  (0): Linear(in_features=784, out_features=128, bias=True)\n  (1): ReLU()\n  (2): Linear(in_features=128, out_features=64, bias=True)\n  (3): ReLU()\n  (4): Linear(in_features=64, out_features=10, bias=True)\n  (5): LogSoftmax(dim=1)\n)"
        );

        assert_eq!(
            model.layer(2).unwrap().describe(),
            "Linear(in_features=128, out_features=64, bias=True)"
        );
        assert_eq!(model.layer(1).unwrap().parameters().len(), 0);
        assert!(model.layer(6).is_none());

        let batch = Tensor::randn([3, 784], &mut rng);
        let log_probs = model.forward(&batch).unwrap();
        assert_eq!(log_probs.shape(), [3, 10]);
        for row in log_probs.exp().data().chunks(10) {
            assert_eq_float!(row.iter().sum::<f32>(), 1.0);
        }
    }

    #[test]
    fn test_zero_grad() {
        let mut model = Sequential::new().add(Linear::new_ones(2, 2));
        let inputs = Tensor::new(vec![1.0, 2.0], [1, 2]).unwrap();
        model.forward(&inputs).unwrap().sum().backward().unwrap();
        assert!(model.parameters().iter().all(|p| p.grad().is_some()));
        model.zero_grad();
        assert!(model.parameters().iter().all(|p| p.grad().is_none()));
    }
}
