//! Optimizer(s)

use crate::tensor::Tensor;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

/// SGD with optional momentum and weight decay
pub struct SGD {
    params: Vec<Tensor>,
    // currently does not change the learning rate based on the iteration
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    // velocity per parameter element
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        Self {
            params,
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            velocity,
        }
    }

    pub fn momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// L2 penalty added to the gradient
    pub fn weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Vec<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, velocity) in self.params.iter().zip(self.velocity.iter_mut()) {
            let mut inner = param.0.borrow_mut();
            // parameters which did not take part in the backward pass are left untouched
            let Some(grad) = inner.grad.clone() else {
                continue;
            };
            for ((theta, v), g) in inner.data.iter_mut().zip(velocity.iter_mut()).zip(grad) {
                let g = g + self.weight_decay * *theta;
                *v = self.momentum * *v - self.lr * g;
                *theta += *v;
            }
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    fn scalar_param(v: f32) -> Tensor {
        Tensor::scalar(v).requires_grad(true)
    }

    #[test]
    fn test_sgd_no_momentum() {
        let a = scalar_param(1.0);
        let b = scalar_param(2.0);
        let c = a.add(&b).unwrap();
        c.backward().unwrap();

        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1);
        optim.step();
        assert_eq!(a.grad().unwrap(), vec![1.0]);
        assert_eq!(b.grad().unwrap(), vec![1.0]);
        assert_eq_float!(a.item().unwrap(), 0.9);
        assert_eq_float!(b.item().unwrap(), 1.9);

        optim.zero_grad();
        assert_eq!(a.grad(), None);
        // stepping without gradients leaves parameters in place
        optim.step();
        assert_eq_float!(a.item().unwrap(), 0.9);
    }

    #[test]
    fn test_sgd_builder() {
        let optim = SGD::new(vec![scalar_param(1.0)], 0.01)
            .momentum(0.9)
            .weight_decay(1e-4);
        assert_eq_float!(optim.lr(), 0.01);
        assert_eq!(optim.velocities(), [vec![0.0f32]].as_slice());
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = scalar_param(1.0);
        let b = scalar_param(2.0);
        let c = a.add(&b).unwrap();
        c.backward().unwrap();

        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1).momentum(0.9);
        optim.step();
        assert_eq_float!(a.item().unwrap(), 0.9);
        assert_eq_float!(b.item().unwrap(), 1.9);
        assert_eq_float!(optim.velocities()[0][0], -0.1);
        optim.step();
        assert_eq_float!(a.item().unwrap(), 0.71);
        assert_eq_float!(b.item().unwrap(), 1.71);
        assert_eq_float!(optim.velocities()[1][0], -0.19);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let a = scalar_param(2.0);
        a.mul(&Tensor::scalar(0.0)).unwrap().backward().unwrap();
        assert_eq!(a.grad().unwrap(), vec![0.0]);

        let mut optim = SGD::new(vec![a.clone()], 0.5).weight_decay(0.1);
        optim.step();
        // theta - lr * (grad + wd * theta) = 2 - 0.5 * 0.2
        assert_eq_float!(a.item().unwrap(), 1.9);
    }

    #[test]
    fn test_step_matches_manual_update() {
        let w = Tensor::new(vec![0.5, -0.5, 1.0, 2.0], [2, 2])
            .unwrap()
            .requires_grad(true);
        let x = Tensor::new(vec![1.0, 2.0], [1, 2]).unwrap();
        x.matmul(&w).unwrap().pow(2.0).mean().backward().unwrap();
        let before = w.data();
        let grad = w.grad().unwrap();

        let mut optim = SGD::new(vec![w.clone()], 0.01);
        optim.step();
        for ((after, before), g) in w.data().iter().zip(before).zip(grad) {
            assert_eq_float!(*after, before - 0.01 * g);
        }
    }
}
