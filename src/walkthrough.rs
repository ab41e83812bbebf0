//! Step by step demonstrations of the pieces used for training: a loss on an untrained
//! model, autograd on a small tensor, the gradients of a model and a single optimizer step.
//!
//! Each step logs what it shows and returns the values it computed.

use rand::Rng;

use crate::{
    loss::Criterion,
    nn::Module,
    optim::{Optim, SGD},
    tensor::{Tensor, TensorError},
    trainer::TrainError,
};

/// Forward pass and loss of a model on one batch
pub fn loss_of_untrained(
    model: &dyn Module,
    criterion: &dyn Criterion,
    images: &Tensor,
    labels: &[usize],
) -> Result<f32, TrainError> {
    let output = model.forward(images)?;
    log::info!("output of shape {:?}", output.shape());
    let loss = criterion.loss(&output, labels)?.item()?;
    log::info!("loss of the untrained model: {}", loss);
    Ok(loss)
}

/// Values of the autograd demonstration
#[derive(Debug)]
pub struct AutogradDemo {
    pub x: Tensor,
    pub grad: Vec<f32>,
    /// `x / 2`, the analytic gradient of `mean(x^2)` for a 2x2 `x`
    pub half_x: Vec<f32>,
}

/// Builds `z = mean(x^2)` for a random 2x2 `x` and backpropagates through it
pub fn autograd_demo<R: Rng + ?Sized>(rng: &mut R) -> Result<AutogradDemo, TensorError> {
    let x = Tensor::randn([2, 2], rng).requires_grad(true);
    log::info!("x = {}", x);
    let y = x.pow(2.0);
    log::info!("y = {}", y);
    if let Some(grad_fn) = y.grad_fn() {
        log::info!("y was created by <{}>", grad_fn);
    }
    let z = y.mean();
    log::info!("z = {}", z);
    log::info!("x.grad before backward: {:?}", x.grad());

    z.backward()?;
    let grad = x.grad().unwrap_or_default();
    let half_x = x.data().iter().map(|v| v / 2.0).collect::<Vec<_>>();
    log::info!("x.grad = {:?}", grad);
    log::info!("x / 2  = {:?}", half_x);
    Ok(AutogradDemo { x, grad, half_x })
}

fn first_weight(model: &dyn Module) -> Result<Tensor, TrainError> {
    model
        .parameters()
        .into_iter()
        .next()
        .ok_or(TrainError::NoParameters)
}

fn log_grad(label: &str, weight: &Tensor) {
    match weight.grad().map(|g| Tensor::new(g, weight.shape())) {
        Some(Ok(grad)) => log::info!("{}:\n{}", label, grad),
        _ => log::info!("{}: None", label),
    }
}

/// Gradient of the first weight before and after a backward pass
#[derive(Debug)]
pub struct GradientDemo {
    pub before: Option<Vec<f32>>,
    pub after: Option<Vec<f32>>,
}

/// Shows that gradients only exist once the loss has been backpropagated
pub fn gradient_demo(
    model: &dyn Module,
    criterion: &dyn Criterion,
    images: &Tensor,
    labels: &[usize],
) -> Result<GradientDemo, TrainError> {
    let weight = first_weight(model)?;
    let loss = criterion.loss(&model.forward(images)?, labels)?;

    log_grad("Before backward pass", &weight);
    let before = weight.grad();
    loss.backward()?;
    log_grad("After backward pass", &weight);
    Ok(GradientDemo {
        before,
        after: weight.grad(),
    })
}

/// First weight of a model around a single optimizer step
#[derive(Debug)]
pub struct StepDemo {
    pub initial: Vec<f32>,
    pub gradient: Vec<f32>,
    pub updated: Vec<f32>,
}

/// Runs one SGD step with learning rate `lr` on a single batch
pub fn optimizer_step_demo(
    model: &dyn Module,
    criterion: &dyn Criterion,
    images: &Tensor,
    labels: &[usize],
    lr: f32,
) -> Result<StepDemo, TrainError> {
    let weight = first_weight(model)?;
    let mut optim = SGD::new(model.parameters(), lr);
    log::info!("SGD with learning rate {}", optim.lr());
    let initial = weight.data();
    log::info!("Initial weights:\n{}", weight);

    // clear gradients, since they accumulate over backward passes
    optim.zero_grad();
    let loss = criterion.loss(&model.forward(images)?, labels)?;
    loss.backward()?;
    log_grad("Gradient", &weight);
    let gradient = weight.grad().unwrap_or_default();

    optim.step();
    log::info!("Updated weights:\n{}", weight);
    Ok(StepDemo {
        initial,
        gradient,
        updated: weight.data(),
    })
}
