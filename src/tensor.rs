//! Two dimensional tensors which form a computation graph
//!
//! Every tensor is a `[rows, cols]` matrix of `f32` in row-major order, scalars are `[1, 1]`.
//! Operations on tensors which require gradients record their inputs, so calling
//! [`Tensor::backward`] on a scalar result propagates gradients back to the leaves.
use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    fmt::{self, Display},
    ops::Neg,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

use crate::backprop_fns::{
    BackpropFunc, update_gradients_one_operand, update_gradients_two_operands,
};

type SharedTensor = Rc<RefCell<InnerTensor>>;

/// `[rows, cols]`
pub type Shape = [usize; 2];

/// Errors for tensor operations
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("data of length {len} does not fit shape {shape:?}")]
    DataLength { len: usize, shape: Shape },
    #[error("shape mismatch in {op}: {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },
    #[error("expected a scalar tensor, got shape {shape:?}")]
    NotScalar { shape: Shape },
    #[error("tensor does not require grad")]
    NoGrad,
    #[error("target {target} is out of range for {n_classes} classes")]
    TargetOutOfRange { target: usize, n_classes: usize },
    #[error("got {got} targets for a batch of {expected}")]
    TargetLength { expected: usize, got: usize },
}

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Returns whether operations currently record the computation graph on this thread
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|enabled| enabled.get())
}

/// Enables or disables graph recording on this thread, analogous to `torch.set_grad_enabled`
pub fn set_grad_enabled(enabled: bool) {
    GRAD_ENABLED.with(|cell| cell.set(enabled));
}

/// Disables graph recording until the returned guard is dropped, analogous to `torch.no_grad`
pub fn no_grad() -> NoGradGuard {
    let prev = is_grad_enabled();
    set_grad_enabled(false);
    NoGradGuard { prev }
}

/// Restores the previous grad mode when dropped
#[must_use = "grad mode is restored as soon as the guard is dropped"]
pub struct NoGradGuard {
    prev: bool,
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}

/// Newtype representing a shared tensor in a computation graph
#[derive(Debug, Clone)]
pub struct Tensor(pub(crate) SharedTensor);

impl Tensor {
    /// Create a new leaf tensor, fails if `data` does not have `rows * cols` elements
    pub fn new(data: Vec<f32>, shape: Shape) -> Result<Self, TensorError> {
        if data.len() != shape[0] * shape[1] {
            return Err(TensorError::DataLength {
                len: data.len(),
                shape,
            });
        }
        Ok(Self::from_inner(InnerTensor::new(data, shape)))
    }

    pub fn scalar(value: f32) -> Self {
        Self::from_inner(InnerTensor::new(vec![value], [1, 1]))
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::from_inner(InnerTensor::new(vec![0.0; shape[0] * shape[1]], shape))
    }

    pub fn ones(shape: Shape) -> Self {
        Self::from_inner(InnerTensor::new(vec![1.0; shape[0] * shape[1]], shape))
    }

    /// Samples every element from the standard normal distribution
    pub fn randn<R: Rng + ?Sized>(shape: Shape, rng: &mut R) -> Self {
        let data: Vec<f32> = (0..shape[0] * shape[1])
            .map(|_| StandardNormal.sample(&mut *rng))
            .collect();
        Self::from_inner(InnerTensor::new(data, shape))
    }

    /// Samples every element uniformly from `[-bound, bound)`, `bound` must be positive
    pub fn uniform<R: Rng + ?Sized>(shape: Shape, bound: f32, rng: &mut R) -> Self {
        let data = (0..shape[0] * shape[1])
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        Self::from_inner(InnerTensor::new(data, shape))
    }

    /// Builds a tensor from equally sized rows
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self, TensorError> {
        let cols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(TensorError::ShapeMismatch {
                    op: "from_rows",
                    lhs: [1, cols],
                    rhs: [1, row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Self::new(data, [rows.len(), cols])
    }

    /// Marks a leaf tensor as requiring gradients
    pub fn requires_grad(self, requires_grad: bool) -> Self {
        self.0.borrow_mut().requires_grad = requires_grad;
        self
    }

    fn from_inner(inner: InnerTensor) -> Self {
        Self(Rc::new(RefCell::new(inner)))
    }

    /// Create a tensor derived from `inputs`. The graph is only recorded when grad mode is
    /// enabled and at least one input requires gradients.
    fn new_derived(
        data: Vec<f32>,
        shape: Shape,
        backprop_fn: BackpropFunc,
        inputs: &[&Tensor],
    ) -> Self {
        let mut inner = InnerTensor::new(data, shape);
        if is_grad_enabled() && inputs.iter().any(|t| t.is_requires_grad()) {
            inner.requires_grad = true;
            inner.backprop_fn = Some(backprop_fn);
            inner.children = inputs.iter().map(|t| t.0.clone()).collect();
        }
        Self::from_inner(inner)
    }

    pub fn data(&self) -> Vec<f32> {
        self.0.borrow().data.clone()
    }

    /// Value of a single element tensor, analogous to `Tensor.item()`
    pub fn item(&self) -> Result<f32, TensorError> {
        let inner = self.0.borrow();
        if inner.data.len() != 1 {
            return Err(TensorError::NotScalar { shape: inner.shape });
        }
        Ok(inner.data[0])
    }

    pub fn shape(&self) -> Shape {
        self.0.borrow().shape
    }

    pub fn rows(&self) -> usize {
        self.shape()[0]
    }

    pub fn cols(&self) -> usize {
        self.shape()[1]
    }

    pub fn numel(&self) -> usize {
        self.0.borrow().data.len()
    }

    /// Accumulated gradient, `None` until a backward pass reaches this tensor
    pub fn grad(&self) -> Option<Vec<f32>> {
        self.0.borrow().grad.clone()
    }

    pub fn is_requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    /// Leaves are tensors which were not created by a recorded operation
    pub fn is_leaf(&self) -> bool {
        self.0.borrow().backprop_fn.is_none()
    }

    /// The operation which created this tensor, `None` for leaves
    pub fn grad_fn(&self) -> Option<BackpropFunc> {
        self.0.borrow().backprop_fn.clone()
    }

    // Strictly, &mut isn't needed since the tensor is behind a shared mutable type,
    // but it indicates that the tensor should be exclusively mutable
    pub fn set_data(&mut self, data: Vec<f32>) -> Result<(), TensorError> {
        let mut inner = self.0.borrow_mut();
        if data.len() != inner.data.len() {
            return Err(TensorError::DataLength {
                len: data.len(),
                shape: inner.shape,
            });
        }
        inner.data = data;
        Ok(())
    }

    /// Clears the accumulated gradient of this tensor
    pub fn zero_grad(&mut self) {
        self.0.borrow_mut().grad = None;
    }

    /// A new leaf sharing no graph with `self`
    pub fn detach(&self) -> Tensor {
        let inner = self.0.borrow();
        Self::from_inner(InnerTensor::new(inner.data.clone(), inner.shape))
    }

    /// Values of row `idx`
    pub fn row(&self, idx: usize) -> Option<Vec<f32>> {
        let inner = self.0.borrow();
        let cols = inner.shape[1];
        (idx < inner.shape[0]).then(|| inner.data[idx * cols..(idx + 1) * cols].to_vec())
    }

    /// Index of the largest value in each row
    pub fn argmax_rows(&self) -> Vec<usize> {
        let inner = self.0.borrow();
        let cols = inner.shape[1].max(1);
        inner
            .data
            .chunks(cols)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 { (i, v) } else { best }
                    })
                    .0
            })
            .collect()
    }

    /// Backpropagates from this scalar tensor.
    ///
    /// Gradients of leaves accumulate over successive calls until they are cleared with
    /// [`Tensor::zero_grad`], gradients of intermediate tensors are recomputed on every call.
    pub fn backward(&self) -> Result<(), TensorError> {
        let shape = self.shape();
        if shape != [1, 1] {
            return Err(TensorError::NotScalar { shape });
        }
        if !self.is_requires_grad() {
            return Err(TensorError::NoGrad);
        }

        let backprop_order = self.topological_order();
        for value in &backprop_order {
            let mut inner = value.0.borrow_mut();
            if inner.backprop_fn.is_some() {
                inner.grad = None;
            }
        }
        // d out / d out = 1
        accumulate_grad(self, vec![1.0]);

        // apply backprop, reversed to start from root first
        for value in backprop_order.iter().rev() {
            let (backprop_fn, children) = {
                let inner = value.0.borrow();
                match &inner.backprop_fn {
                    Some(backprop_fn) if inner.grad.is_some() => {
                        (backprop_fn.clone(), inner.children.clone())
                    }
                    _ => continue,
                }
            };
            match (backprop_fn.n_operands(), children.as_slice()) {
                (1, [in1]) => update_gradients_one_operand(&Tensor(in1.clone()), value),
                (2, [in1, in2]) => {
                    update_gradients_two_operands(&Tensor(in1.clone()), &Tensor(in2.clone()), value)
                }
                (n, _) => panic!(
                    "{} expects {} operands, got {}",
                    backprop_fn,
                    n,
                    children.len()
                ),
            }
        }
        Ok(())
    }

    /// Post order traversal of the graph below this tensor (inputs before outputs)
    fn topological_order(&self) -> Vec<Tensor> {
        enum Action {
            Visit(Tensor),
            PostVisit(Tensor),
        }

        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        let mut stack = vec![Action::Visit(self.clone())];
        while let Some(action) = stack.pop() {
            match action {
                Action::Visit(t) => {
                    if !visited.insert(t.id()) {
                        continue;
                    }
                    stack.push(Action::PostVisit(t.clone()));
                    for c in t.0.borrow().children.iter() {
                        stack.push(Action::Visit(Tensor(c.clone())));
                    }
                }
                Action::PostVisit(t) => order.push(t),
            }
        }
        order
    }

    fn id(&self) -> u64 {
        self.0.borrow().id
    }
}

/// Adds `grad` to the gradient of `t` if it requires gradients
pub(crate) fn accumulate_grad(t: &Tensor, grad: Vec<f32>) {
    let mut inner = t.0.borrow_mut();
    if !inner.requires_grad {
        return;
    }
    match inner.grad.as_mut() {
        Some(existing) => {
            for (e, g) in existing.iter_mut().zip(grad) {
                *e += g;
            }
        }
        None => inner.grad = Some(grad),
    }
}

/// Index into a (possibly broadcast) operand of shape `shape` for element `(r, c)` of the result
pub(crate) fn broadcast_index(shape: Shape, r: usize, c: usize) -> usize {
    let r = if shape[0] == 1 { 0 } else { r };
    let c = if shape[1] == 1 { 0 } else { c };
    r * shape[1] + c
}

/// `a [m, k] x b [k, n]`
pub(crate) fn matmul_raw(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        let out_row = &mut out[i * n..(i + 1) * n];
        for p in 0..k {
            let a_ip = a[i * k + p];
            let b_row = &b[p * n..(p + 1) * n];
            for (o, b_pj) in out_row.iter_mut().zip(b_row) {
                *o += a_ip * b_pj;
            }
        }
    }
    out
}

pub(crate) fn transpose_raw(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

// Various operations on tensors
impl Tensor {
    /// Elementwise binary op where `other` may be broadcast along rows and/or columns
    fn elementwise(
        &self,
        other: &Tensor,
        op: &'static str,
        backprop_fn: BackpropFunc,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Tensor, TensorError> {
        let (data, shape) = {
            let lhs = self.0.borrow();
            let rhs = other.0.borrow();
            let [rows, cols] = lhs.shape;
            let rows_ok = rhs.shape[0] == rows || rhs.shape[0] == 1;
            let cols_ok = rhs.shape[1] == cols || rhs.shape[1] == 1;
            if !rows_ok || !cols_ok {
                return Err(TensorError::ShapeMismatch {
                    op,
                    lhs: lhs.shape,
                    rhs: rhs.shape,
                });
            }
            let mut data = Vec::with_capacity(rows * cols);
            for r in 0..rows {
                for c in 0..cols {
                    let b = rhs.data[broadcast_index(rhs.shape, r, c)];
                    data.push(f(lhs.data[r * cols + c], b));
                }
            }
            (data, lhs.shape)
        };
        Ok(Tensor::new_derived(data, shape, backprop_fn, &[self, other]))
    }

    fn unary(&self, backprop_fn: BackpropFunc, f: impl Fn(f32) -> f32) -> Tensor {
        let (data, shape) = {
            let inner = self.0.borrow();
            (inner.data.iter().map(|&v| f(v)).collect(), inner.shape)
        };
        Tensor::new_derived(data, shape, backprop_fn, &[self])
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.elementwise(other, "add", BackpropFunc::Add, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.elementwise(other, "sub", BackpropFunc::Sub, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.elementwise(other, "mul", BackpropFunc::Mul, |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.elementwise(other, "div", BackpropFunc::Div, |a, b| a / b)
    }

    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let (data, shape) = {
            let a = self.0.borrow();
            let b = other.0.borrow();
            let [m, k] = a.shape;
            let [k2, n] = b.shape;
            if k != k2 {
                return Err(TensorError::ShapeMismatch {
                    op: "matmul",
                    lhs: a.shape,
                    rhs: b.shape,
                });
            }
            (matmul_raw(&a.data, &b.data, m, k, n), [m, n])
        };
        Ok(Tensor::new_derived(data, shape, BackpropFunc::MatMul, &[self, other]))
    }

    pub fn transpose(&self) -> Tensor {
        let (data, shape) = {
            let inner = self.0.borrow();
            let [rows, cols] = inner.shape;
            (transpose_raw(&inner.data, rows, cols), [cols, rows])
        };
        Tensor::new_derived(data, shape, BackpropFunc::Transpose, &[self])
    }

    pub fn pow(&self, exponent: f32) -> Tensor {
        self.unary(BackpropFunc::Pow(exponent), |v| v.powf(exponent))
    }

    pub fn relu(&self) -> Tensor {
        self.unary(BackpropFunc::ReLU, |v| v.max(0.0))
    }

    pub fn exp(&self) -> Tensor {
        self.unary(BackpropFunc::Exp, f32::exp)
    }

    pub fn log(&self) -> Tensor {
        self.unary(BackpropFunc::Log, f32::ln)
    }

    /// Sum of all elements as a scalar
    pub fn sum(&self) -> Tensor {
        let total = self.0.borrow().data.iter().sum();
        Tensor::new_derived(vec![total], [1, 1], BackpropFunc::Sum, &[self])
    }

    /// Mean of all elements as a scalar
    pub fn mean(&self) -> Tensor {
        let mean = {
            let inner = self.0.borrow();
            inner.data.iter().sum::<f32>() / inner.data.len() as f32
        };
        Tensor::new_derived(vec![mean], [1, 1], BackpropFunc::Mean, &[self])
    }

    /// Log of the softmax of each row, computed with the max subtracted for stability
    pub fn log_softmax(&self) -> Tensor {
        let (data, shape) = {
            let inner = self.0.borrow();
            let cols = inner.shape[1].max(1);
            let mut out = Vec::with_capacity(inner.data.len());
            for row in inner.data.chunks(cols) {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let log_sum_exp = max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                out.extend(row.iter().map(|v| v - log_sum_exp));
            }
            (out, inner.shape)
        };
        Tensor::new_derived(data, shape, BackpropFunc::LogSoftmax, &[self])
    }

    /// Softmax of each row
    pub fn softmax(&self) -> Tensor {
        self.log_softmax().exp()
    }

    /// Negative log likelihood of `targets` given per-row log probabilities, averaged over rows
    pub fn nll_loss(&self, targets: &[usize]) -> Result<Tensor, TensorError> {
        let loss = {
            let inner = self.0.borrow();
            let [rows, cols] = inner.shape;
            if targets.len() != rows {
                return Err(TensorError::TargetLength {
                    expected: rows,
                    got: targets.len(),
                });
            }
            let mut total = 0.0;
            for (r, &t) in targets.iter().enumerate() {
                if t >= cols {
                    return Err(TensorError::TargetOutOfRange {
                        target: t,
                        n_classes: cols,
                    });
                }
                total += inner.data[r * cols + t];
            }
            -total / rows as f32
        };
        Ok(Tensor::new_derived(
            vec![loss],
            [1, 1],
            BackpropFunc::NllLoss(targets.to_vec()),
            &[self],
        ))
    }
}

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        self.unary(BackpropFunc::Neg, |v| -v)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        let a = self.0.borrow();
        let b = other.0.borrow();
        a.shape == b.shape && a.data == b.data
    }
}

// unfortunate that there isn't a blanket impl for AsRef<T> for T
// <https://doc.rust-lang.org/std/convert/trait.AsRef.html#reflexivity>
impl AsRef<Tensor> for Tensor {
    fn as_ref(&self) -> &Tensor {
        self
    }
}

// pretty print like `tensor([[1.0000, 2.0000]], grad_fn=<AddBackward>)`, eliding large dimensions
impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const EDGE: usize = 3;
        fn visible(n: usize) -> Vec<Option<usize>> {
            if n <= 2 * EDGE {
                (0..n).map(Some).collect()
            } else {
                (0..EDGE)
                    .map(Some)
                    .chain(std::iter::once(None))
                    .chain((n - EDGE..n).map(Some))
                    .collect()
            }
        }

        let inner = self.0.borrow();
        let [rows, cols] = inner.shape;
        write!(f, "tensor([")?;
        for (i, r) in visible(rows).into_iter().enumerate() {
            if i > 0 {
                write!(f, ",\n        ")?;
            }
            let Some(r) = r else {
                write!(f, "...")?;
                continue;
            };
            write!(f, "[")?;
            for (j, c) in visible(cols).into_iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                match c {
                    Some(c) => write!(f, "{:.4}", inner.data[r * cols + c])?,
                    None => write!(f, "...")?,
                }
            }
            write!(f, "]")?;
        }
        write!(f, "]")?;
        match &inner.backprop_fn {
            Some(backprop_fn) => write!(f, ", grad_fn=<{}>", backprop_fn)?,
            None if inner.requires_grad => write!(f, ", requires_grad=true")?,
            None => {}
        }
        write!(f, ")")
    }
}

#[derive(Debug)]
pub(crate) struct InnerTensor {
    pub(crate) data: Vec<f32>,
    pub(crate) shape: Shape,
    /// gradient of the graph output with respect to this tensor
    pub(crate) grad: Option<Vec<f32>>,
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedTensor>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this tensor from its children
    /// `None` when the tensor is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerTensor {
    fn new(data: Vec<f32>, shape: Shape) -> Self {
        Self {
            data,
            shape,
            grad: None,
            requires_grad: false,
            children: vec![],
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            backprop_fn: None,
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!((($a) - ($b)).abs() < 1e-5, "{} != {}", $a, $b);
        };
    }

    fn leaf(data: Vec<f32>, shape: Shape) -> Tensor {
        Tensor::new(data, shape).unwrap().requires_grad(true)
    }

    #[test]
    fn test_new_checks_length() {
        let err = Tensor::new(vec![1.0, 2.0, 3.0], [2, 2]).unwrap_err();
        assert_eq!(
            err,
            TensorError::DataLength {
                len: 3,
                shape: [2, 2]
            }
        );
    }

    #[test]
    fn test_from_rows() {
        let a = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        assert_eq!(a.shape(), [3, 2]);
        assert_eq!(a.row(2), Some(vec![5.0, 6.0]));

        let err = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert_eq!(
            err,
            TensorError::ShapeMismatch {
                op: "from_rows",
                lhs: [1, 2],
                rhs: [1, 1]
            }
        );

        let empty = Tensor::from_rows::<Vec<f32>>(&[]).unwrap();
        assert_eq!(empty.shape(), [0, 0]);
        assert_eq!(empty.numel(), 0);
    }

    #[test]
    fn test_set_data() {
        let mut a = leaf(vec![1.0, 2.0], [1, 2]);
        a.set_data(vec![3.0, 4.0]).unwrap();
        assert_eq!(a.data(), vec![3.0, 4.0]);
        assert!(a.is_requires_grad());

        assert_eq!(
            a.set_data(vec![1.0]).unwrap_err(),
            TensorError::DataLength {
                len: 1,
                shape: [1, 2]
            }
        );
        assert_eq!(a.data(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_detach() {
        let a = leaf(vec![1.0, 2.0], [1, 2]);
        let b = a.pow(2.0);
        let detached = b.detach();
        assert_eq!(detached.data(), vec![1.0, 4.0]);
        assert!(detached.is_leaf());
        assert!(!detached.is_requires_grad());
        assert_eq!(detached.grad_fn(), None);

        // gradients stop at the detached tensor
        let c = leaf(vec![2.0, 2.0], [1, 2]);
        detached.mul(&c).unwrap().sum().backward().unwrap();
        assert_eq!(c.grad().unwrap(), vec![1.0, 4.0]);
        assert_eq!(a.grad(), None);
    }

    #[test]
    fn test_operand_counts() {
        let a = leaf(vec![1.0, 2.0], [1, 2]);
        let b = leaf(vec![3.0, 4.0], [1, 2]);
        assert_eq!(a.add(&b).unwrap().grad_fn().unwrap().n_operands(), 2);
        assert_eq!(a.matmul(&b.transpose()).unwrap().grad_fn().unwrap().n_operands(), 2);
        assert_eq!(a.exp().grad_fn().unwrap().n_operands(), 1);
        assert_eq!(a.nll_loss(&[1]).unwrap().grad_fn().unwrap().n_operands(), 1);
    }

    #[test]
    fn test_add_broadcast_row() {
        let a = leaf(vec![1.0, 2.0, 3.0, 4.0], [2, 2]);
        let b = leaf(vec![10.0, 20.0], [1, 2]);

        let c = a.add(&b).unwrap();
        assert_eq!(c.data(), vec![11.0, 22.0, 13.0, 24.0]);
        c.sum().backward().unwrap();

        // dc/da = 1, db is summed over the broadcast rows
        assert_eq!(a.grad().unwrap(), vec![1.0; 4]);
        assert_eq!(b.grad().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_add_shape_mismatch() {
        let a = Tensor::zeros([2, 3]);
        let b = Tensor::zeros([2, 2]);
        assert!(matches!(
            a.add(&b),
            Err(TensorError::ShapeMismatch { op: "add", .. })
        ));
    }

    #[test]
    fn test_mul() {
        let a = leaf(vec![2.0], [1, 1]);
        let b = leaf(vec![3.0], [1, 1]);

        let c = a.mul(&b).unwrap();
        assert_eq!(c.item().unwrap(), 6.0);
        c.backward().unwrap();

        // dc/da = b
        // dc/db = a
        assert_eq!(a.grad().unwrap(), vec![3.0]);
        assert_eq!(b.grad().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_mul_same_operand() {
        let a = leaf(vec![3.0], [1, 1]);
        let c = a.mul(&a).unwrap();
        c.backward().unwrap();
        assert_eq!(a.grad().unwrap(), vec![6.0]);
    }

    #[test]
    fn test_sub_and_neg() {
        let a = leaf(vec![2.0], [1, 1]);
        let b = leaf(vec![3.0], [1, 1]);

        let c = -&a.sub(&b).unwrap();
        assert_eq!(c.item().unwrap(), 1.0);
        c.backward().unwrap();

        assert_eq!(a.grad().unwrap(), vec![-1.0]);
        assert_eq!(b.grad().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_div() {
        let a = leaf(vec![2.0], [1, 1]);
        let b = leaf(vec![3.0], [1, 1]);

        let c = a.div(&b).unwrap();
        assert_eq_float!(c.item().unwrap(), 2.0 / 3.0);
        c.backward().unwrap();

        // dc/da = 1/b
        // dc/db = -a/b^2
        assert_eq_float!(a.grad().unwrap()[0], 1.0 / 3.0);
        assert_eq_float!(b.grad().unwrap()[0], -2.0 / 9.0);
    }

    #[test]
    fn test_matmul() {
        let a = leaf(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
        let b = leaf(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], [3, 2]);

        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), [2, 2]);
        assert_eq!(c.data(), vec![4.0, 5.0, 10.0, 11.0]);
        c.sum().backward().unwrap();

        // d a = 1 @ b^T, row sums of b
        assert_eq!(a.grad().unwrap(), vec![1.0, 1.0, 2.0, 1.0, 1.0, 2.0]);
        // d b = a^T @ 1, column sums of a
        assert_eq!(b.grad().unwrap(), vec![5.0, 5.0, 7.0, 7.0, 9.0, 9.0]);
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let a = Tensor::zeros([2, 3]);
        assert_eq!(
            a.matmul(&Tensor::zeros([2, 3])).unwrap_err(),
            TensorError::ShapeMismatch {
                op: "matmul",
                lhs: [2, 3],
                rhs: [2, 3]
            }
        );
    }

    #[test]
    fn test_transpose() {
        let a = leaf(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
        let t = a.transpose();
        assert_eq!(t.shape(), [3, 2]);
        assert_eq!(t.data(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let weights = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]).unwrap();
        t.mul(&weights).unwrap().sum().backward().unwrap();
        assert_eq!(a.grad().unwrap(), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_pow_mean_gradient_is_half_x() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let x = Tensor::randn([2, 2], &mut rng).requires_grad(true);
        let y = x.pow(2.0);
        assert_eq!(y.grad_fn(), Some(BackpropFunc::Pow(2.0)));
        let z = y.mean();
        z.backward().unwrap();

        for (g, v) in x.grad().unwrap().iter().zip(x.data()) {
            assert_eq_float!(*g, v / 2.0);
        }
    }

    #[test]
    fn test_relu() {
        let a = leaf(vec![-1.0, 2.0], [1, 2]);
        let z = a.relu();
        assert_eq!(z.data(), vec![0.0, 2.0]);
        z.sum().backward().unwrap();
        assert_eq!(a.grad().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_exp_log() {
        let a = leaf(vec![2.0], [1, 1]);
        let z = a.exp().log();
        assert_eq_float!(z.item().unwrap(), 2.0);
        z.backward().unwrap();
        assert_eq_float!(a.grad().unwrap()[0], 1.0);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 1000.0, 0.0, -1000.0], [2, 3]).unwrap();
        let probs = a.softmax();
        for row in probs.data().chunks(3) {
            assert_eq_float!(row.iter().sum::<f32>(), 1.0);
        }
        assert_eq_float!(probs.data()[3], 1.0);
    }

    #[test]
    fn test_log_softmax_gradient() {
        // Softmax(x1, x2) = (exp(x1) / (exp(x1) + exp(x2)), ...)
        // d log s1 / dx1 = 1 - s1
        // d log s1 / dx2 = -s2
        let x = leaf(vec![1.0, 2.0], [1, 2]);
        let log_probs = x.log_softmax();
        let picked = log_probs
            .mul(&Tensor::new(vec![1.0, 0.0], [1, 2]).unwrap())
            .unwrap()
            .sum();
        picked.backward().unwrap();

        let s1 = 0.2689414;
        let s2 = 0.7310586;
        let grad = x.grad().unwrap();
        assert_eq_float!(grad[0], 1.0 - s1);
        assert_eq_float!(grad[1], -s2);
    }

    #[test]
    fn test_nll_loss() {
        let log_probs = leaf(vec![-0.5, -1.0, -2.0, -0.1], [2, 2]);
        let loss = log_probs.nll_loss(&[1, 0]).unwrap();
        assert_eq_float!(loss.item().unwrap(), (1.0 + 2.0) / 2.0);
        loss.backward().unwrap();
        assert_eq!(log_probs.grad().unwrap(), vec![0.0, -0.5, -0.5, 0.0]);
    }

    #[test]
    fn test_nll_loss_errors() {
        let log_probs = Tensor::zeros([2, 3]);
        assert_eq!(
            log_probs.nll_loss(&[0]).unwrap_err(),
            TensorError::TargetLength {
                expected: 2,
                got: 1
            }
        );
        assert_eq!(
            log_probs.nll_loss(&[0, 3]).unwrap_err(),
            TensorError::TargetOutOfRange {
                target: 3,
                n_classes: 3
            }
        );
    }

    #[test]
    fn test_gradients_accumulate_until_zeroed() {
        let mut a = leaf(vec![1.0, 2.0], [1, 2]);
        let loss = a.pow(2.0).sum();
        loss.backward().unwrap();
        loss.backward().unwrap();
        assert_eq!(a.grad().unwrap(), vec![4.0, 8.0]);

        a.zero_grad();
        assert_eq!(a.grad(), None);
        a.pow(2.0).sum().backward().unwrap();
        assert_eq!(a.grad().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_backward_errors() {
        let a = leaf(vec![1.0, 2.0], [1, 2]);
        assert_eq!(
            a.relu().backward().unwrap_err(),
            TensorError::NotScalar { shape: [1, 2] }
        );
        assert_eq!(
            Tensor::scalar(1.0).backward().unwrap_err(),
            TensorError::NoGrad
        );
    }

    #[test]
    fn test_no_grad() {
        let a = leaf(vec![1.0], [1, 1]);
        {
            let _guard = no_grad();
            assert!(!is_grad_enabled());
            let b = a.exp();
            assert!(!b.is_requires_grad());
            assert!(b.is_leaf());
        }
        assert!(is_grad_enabled());
        assert_eq!(a.exp().grad_fn(), Some(BackpropFunc::Exp));
    }

    #[test]
    fn test_argmax_and_row() {
        let a = Tensor::new(vec![0.1, 0.7, 0.2, 0.9, 0.05, 0.05], [2, 3]).unwrap();
        assert_eq!(a.argmax_rows(), vec![1, 0]);
        assert_eq!(a.row(1), Some(vec![0.9, 0.05, 0.05]));
        assert_eq!(a.row(2), None);
    }

    #[test]
    fn test_display() {
        let a = leaf(vec![1.0, 2.0], [1, 2]);
        assert_eq!(format!("{}", a), "tensor([[1.0000, 2.0000]], requires_grad=true)");
        let b = a.pow(2.0);
        assert_eq!(
            format!("{}", b),
            "tensor([[1.0000, 4.0000]], grad_fn=<PowBackward>)"
        );
    }
}
