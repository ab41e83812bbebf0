//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph.

use std::fmt::{self, Display};

use crate::tensor::{
    Shape, Tensor, accumulate_grad, broadcast_index, matmul_raw, transpose_raw,
};

/// Represents the function in the computation graph
#[derive(Debug, Clone, PartialEq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    MatMul,
    Neg,
    Transpose,
    /// Power with a constant exponent
    Pow(f32),
    ReLU,
    Exp,
    Log,
    Sum,
    Mean,
    LogSoftmax,
    /// Mean negative log likelihood, holds the target class of each row
    NllLoss(Vec<usize>),
}

impl BackpropFunc {
    /// Number of inputs the operation was applied to
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::MatMul => 2,
            _ => 1,
        }
    }
}

// named after the autograd nodes of PyTorch, e.g. `PowBackward`
impl Display for BackpropFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackpropFunc::Add => "Add",
            BackpropFunc::Sub => "Sub",
            BackpropFunc::Mul => "Mul",
            BackpropFunc::Div => "Div",
            BackpropFunc::MatMul => "Mm",
            BackpropFunc::Neg => "Neg",
            BackpropFunc::Transpose => "T",
            BackpropFunc::Pow(_) => "Pow",
            BackpropFunc::ReLU => "Relu",
            BackpropFunc::Exp => "Exp",
            BackpropFunc::Log => "Log",
            BackpropFunc::Sum => "Sum",
            BackpropFunc::Mean => "Mean",
            BackpropFunc::LogSoftmax => "LogSoftmax",
            BackpropFunc::NllLoss(_) => "NllLoss",
        };
        write!(f, "{}Backward", name)
    }
}

fn snapshot(t: &Tensor) -> (Vec<f32>, Shape) {
    let inner = t.0.borrow();
    (inner.data.clone(), inner.shape)
}

fn out_grad(out: &Tensor) -> Vec<f32> {
    out.grad().unwrap_or_else(|| vec![0.0; out.numel()])
}

/// Sums a gradient of shape `out_shape` down to the shape of a broadcast operand
fn reduce_to(grad: &[f32], out_shape: Shape, shape: Shape) -> Vec<f32> {
    if out_shape == shape {
        return grad.to_vec();
    }
    let mut reduced = vec![0.0; shape[0] * shape[1]];
    let cols = out_shape[1];
    for r in 0..out_shape[0] {
        for c in 0..cols {
            reduced[broadcast_index(shape, r, c)] += grad[r * cols + c];
        }
    }
    reduced
}

/// Represents backprop for the operation `in1 + in2 = out`
pub fn add(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let grad = out_grad(out);
    let out_shape = out.shape();
    accumulate_grad(in2, reduce_to(&grad, out_shape, in2.shape()));
    accumulate_grad(in1, grad);
}

/// Represents backprop for the operation `in1 - in2 = out`
pub fn sub(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let grad = out_grad(out);
    let neg_grad = grad.iter().map(|g| -g).collect::<Vec<_>>();
    accumulate_grad(in2, reduce_to(&neg_grad, out.shape(), in2.shape()));
    accumulate_grad(in1, grad);
}

/// Represents backprop for the operation `in1 * in2 = out`
pub fn mul(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let grad = out_grad(out);
    let out_shape = out.shape();
    let (a, _) = snapshot(in1);
    let (b, b_shape) = snapshot(in2);
    let cols = out_shape[1];
    let mut d_in1 = Vec::with_capacity(grad.len());
    let mut d_in2 = Vec::with_capacity(grad.len());
    for r in 0..out_shape[0] {
        for c in 0..cols {
            let i = r * cols + c;
            d_in1.push(grad[i] * b[broadcast_index(b_shape, r, c)]);
            d_in2.push(grad[i] * a[i]);
        }
    }
    accumulate_grad(in1, d_in1);
    accumulate_grad(in2, reduce_to(&d_in2, out_shape, b_shape));
}

/// Represents backprop for the operation `in1 / in2 = out`
pub fn div(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let grad = out_grad(out);
    let out_shape = out.shape();
    let (a, _) = snapshot(in1);
    let (b, b_shape) = snapshot(in2);
    let cols = out_shape[1];
    let mut d_in1 = Vec::with_capacity(grad.len());
    let mut d_in2 = Vec::with_capacity(grad.len());
    for r in 0..out_shape[0] {
        for c in 0..cols {
            let i = r * cols + c;
            let b_rc = b[broadcast_index(b_shape, r, c)];
            d_in1.push(grad[i] / b_rc);
            d_in2.push(-a[i] * grad[i] / b_rc.powi(2));
        }
    }
    accumulate_grad(in1, d_in1);
    accumulate_grad(in2, reduce_to(&d_in2, out_shape, b_shape));
}

/// Represents backprop for the operation `in1 @ in2 = out`:
/// `d in1 = d out @ in2^T` and `d in2 = in1^T @ d out`
pub fn matmul(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let grad = out_grad(out);
    let [m, n] = out.shape();
    let (a, [_, k]) = snapshot(in1);
    let (b, _) = snapshot(in2);
    // inputs such as data batches do not need their (expensive) gradient
    if in1.is_requires_grad() {
        let b_t = transpose_raw(&b, k, n);
        accumulate_grad(in1, matmul_raw(&grad, &b_t, m, n, k));
    }
    if in2.is_requires_grad() {
        let a_t = transpose_raw(&a, m, k);
        accumulate_grad(in2, matmul_raw(&a_t, &grad, k, m, n));
    }
}

/// Represents backprop for the operation `-in = out`
pub fn neg(in1: &Tensor, out: &Tensor) {
    let grad = out_grad(out).into_iter().map(|g| -g).collect();
    accumulate_grad(in1, grad);
}

/// Represents backprop for the operation `in^T = out`
pub fn transpose(in1: &Tensor, out: &Tensor) {
    let [rows, cols] = out.shape();
    accumulate_grad(in1, transpose_raw(&out_grad(out), rows, cols));
}

/// Represents backprop for the operation `in^p = out` with a constant `p`
pub fn pow(in1: &Tensor, exponent: f32, out: &Tensor) {
    let (x, _) = snapshot(in1);
    let grad = out_grad(out)
        .iter()
        .zip(x)
        .map(|(g, x)| exponent * x.powf(exponent - 1.0) * g)
        .collect();
    accumulate_grad(in1, grad);
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(in1: &Tensor, out: &Tensor) {
    let (x, _) = snapshot(in1);
    let grad = out_grad(out)
        .iter()
        .zip(x)
        .map(|(g, x)| if x > 0.0 { *g } else { 0.0 })
        .collect();
    accumulate_grad(in1, grad);
}

/// Represents backprop for the operation `exp(in) = out`
pub fn exp(in1: &Tensor, out: &Tensor) {
    let (y, _) = snapshot(out); // exp(in)
    let grad = out_grad(out).iter().zip(y).map(|(g, y)| g * y).collect();
    accumulate_grad(in1, grad);
}

/// Represents backprop for the operation `ln(in) = out`
pub fn log(in1: &Tensor, out: &Tensor) {
    let (x, _) = snapshot(in1);
    let grad = out_grad(out).iter().zip(x).map(|(g, x)| g / x).collect();
    accumulate_grad(in1, grad);
}

/// Represents backprop for the operation `sum(in) = out`
pub fn sum(in1: &Tensor, out: &Tensor) {
    let g = out_grad(out)[0];
    accumulate_grad(in1, vec![g; in1.numel()]);
}

/// Represents backprop for the operation `mean(in) = out`
pub fn mean(in1: &Tensor, out: &Tensor) {
    let n = in1.numel();
    let g = out_grad(out)[0] / n as f32;
    accumulate_grad(in1, vec![g; n]);
}

/// Represents backprop for the operation `log_softmax(in) = out` applied to each row:
/// `d in = d out - softmax(in) * sum(d out)`
pub fn log_softmax(in1: &Tensor, out: &Tensor) {
    let (y, [_, cols]) = snapshot(out);
    let grad = out_grad(out);
    let cols = cols.max(1);
    let mut d_in = Vec::with_capacity(grad.len());
    for (g_row, y_row) in grad.chunks(cols).zip(y.chunks(cols)) {
        let g_sum = g_row.iter().sum::<f32>();
        d_in.extend(g_row.iter().zip(y_row).map(|(g, y)| g - y.exp() * g_sum));
    }
    accumulate_grad(in1, d_in);
}

/// Represents backprop for the operation `nll_loss(in, targets) = out`
pub fn nll_loss(in1: &Tensor, targets: &[usize], out: &Tensor) {
    let [rows, cols] = in1.shape();
    let g = out_grad(out)[0];
    let mut d_in = vec![0.0; rows * cols];
    for (r, &t) in targets.iter().enumerate() {
        d_in[r * cols + t] = -g / rows as f32;
    }
    accumulate_grad(in1, d_in);
}

/// Applies a backprop function for operators with two operands
pub fn update_gradients_two_operands(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn.clone() };
    match backprop_fn {
        Some(BackpropFunc::Add) => add(in1, in2, out),
        Some(BackpropFunc::Sub) => sub(in1, in2, out),
        Some(BackpropFunc::Mul) => mul(in1, in2, out),
        Some(BackpropFunc::Div) => div(in1, in2, out),
        Some(BackpropFunc::MatMul) => matmul(in1, in2, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with one operand
pub fn update_gradients_one_operand(in1: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn.clone() };
    match backprop_fn {
        Some(BackpropFunc::Neg) => neg(in1, out),
        Some(BackpropFunc::Transpose) => transpose(in1, out),
        Some(BackpropFunc::Pow(exponent)) => pow(in1, exponent, out),
        Some(BackpropFunc::ReLU) => relu(in1, out),
        Some(BackpropFunc::Exp) => exp(in1, out),
        Some(BackpropFunc::Log) => log(in1, out),
        Some(BackpropFunc::Sum) => sum(in1, out),
        Some(BackpropFunc::Mean) => mean(in1, out),
        Some(BackpropFunc::LogSoftmax) => log_softmax(in1, out),
        Some(BackpropFunc::NllLoss(ref targets)) => nll_loss(in1, targets, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}
