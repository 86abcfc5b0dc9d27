//! # Stochastic Gradient Descent (SGD) Optimizer

use super::Optimizer;
use crate::tensor::{Tensor, TensorData, TensorError};
use log::trace;
use ndarray::ArrayD;
use std::collections::HashMap;

/// Implements stochastic gradient descent with optional momentum,
/// dampening, weight decay, and Nesterov momentum.
pub struct Sgd {
    params: Vec<Tensor>,
    lr: TensorData,
    momentum: TensorData,
    dampening: TensorData,
    weight_decay: TensorData,
    nesterov: bool,
    // One momentum buffer per parameter, keyed by storage identity.
    momentum_buffers: HashMap<usize, ArrayD<TensorData>>,
}

impl Sgd {
    /// Creates a new SGD optimizer instance.
    ///
    /// # Arguments
    /// * `params`: The parameters to optimize.
    /// * `lr`: Learning rate.
    /// * `momentum`: Momentum factor (default: 0).
    /// * `dampening`: Dampening for momentum (default: 0).
    /// * `weight_decay`: L2 penalty (default: 0).
    /// * `nesterov`: Enables Nesterov momentum; requires momentum > 0 and
    ///   zero dampening.
    pub fn new<I>(
        params: I,
        lr: TensorData,
        momentum: Option<TensorData>,
        dampening: Option<TensorData>,
        weight_decay: Option<TensorData>,
        nesterov: bool,
    ) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        let params_vec: Vec<Tensor> = params.into_iter().collect();
        if lr < 0.0 {
            return Err(TensorError::Generic(
                "Invalid learning rate: cannot be negative".to_string(),
            ));
        }
        let momentum_val = momentum.unwrap_or(0.0);
        let dampening_val = dampening.unwrap_or(0.0);
        let weight_decay_val = weight_decay.unwrap_or(0.0);

        if momentum_val < 0.0 {
            return Err(TensorError::Generic(
                "Invalid momentum value: cannot be negative".to_string(),
            ));
        }
        if weight_decay_val < 0.0 {
            return Err(TensorError::Generic(
                "Invalid weight_decay value: cannot be negative".to_string(),
            ));
        }
        if nesterov && (momentum_val <= 0.0 || dampening_val != 0.0) {
            return Err(TensorError::Generic(
                "Nesterov momentum requires momentum > 0 and dampening = 0".to_string(),
            ));
        }

        Ok(Sgd {
            params: params_vec,
            lr,
            momentum: momentum_val,
            dampening: dampening_val,
            weight_decay: weight_decay_val,
            nesterov,
            momentum_buffers: HashMap::new(),
        })
    }

    /// Plain gradient descent with only a learning rate.
    pub fn simple<I>(params: I, lr: TensorData) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::new(params, lr, None, None, None, false)
    }
}

impl Optimizer for Sgd {
    fn step(&mut self) -> Result<(), TensorError> {
        trace!("Sgd: step lr={}", self.lr);
        for param in &self.params {
            if !param.requires_grad() {
                continue;
            }
            let mut grad = match param.grad_array() {
                Some(g) => g,
                None => continue,
            };

            if self.weight_decay != 0.0 {
                grad = grad + &*param.data() * self.weight_decay;
            }

            let direction = if self.momentum != 0.0 {
                let buf = match self.momentum_buffers.entry(param.storage_ptr()) {
                    std::collections::hash_map::Entry::Occupied(entry) => {
                        let buf = entry.into_mut();
                        // buf = momentum * buf + (1 - dampening) * grad
                        *buf = &*buf * self.momentum + &grad * (1.0 - self.dampening);
                        buf
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(grad.clone())
                    }
                };
                if self.nesterov {
                    grad + &*buf * self.momentum
                } else {
                    buf.clone()
                }
            } else {
                grad
            };

            let mut data = param.data_mut();
            *data -= &(&direction * self.lr);
        }
        Ok(())
    }

    fn zero_grad(&mut self) {
        for param in &self.params {
            if param.requires_grad() {
                param.zero_grad();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::ops;
    use approx::assert_relative_eq;

    fn quadratic_loss(param: &Tensor, target: TensorData) -> Tensor {
        let shifted = ops::sub_scalar(param, target).unwrap();
        let squared = ops::mul(&shifted, &shifted).unwrap();
        ops::sum(&squared).unwrap()
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        let p = Tensor::from_vec(vec![0.0], true);
        assert!(Sgd::simple(vec![p.clone()], -0.1).is_err());
        assert!(Sgd::new(vec![p.clone()], 0.1, Some(-0.5), None, None, false).is_err());
        // Nesterov without momentum is rejected.
        assert!(Sgd::new(vec![p], 0.1, None, None, None, true).is_err());
    }

    #[test]
    fn plain_step_moves_against_the_gradient() {
        let p = Tensor::from_vec(vec![0.0], true);
        let mut sgd = Sgd::simple(vec![p.clone()], 0.1).unwrap();

        sgd.zero_grad();
        let loss = quadratic_loss(&p, 3.0);
        loss.backward().unwrap();
        sgd.step().unwrap();

        // grad = 2(p - 3) = -6, so p moves to 0.6
        assert_relative_eq!(p.data()[[0]], 0.6, epsilon = 1e-5);
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let p = Tensor::from_vec(vec![0.0], true);
        let mut sgd =
            Sgd::new(vec![p.clone()], 0.01, Some(0.9), None, None, false).unwrap();

        let mut last = 0.0;
        let mut previous_step = 0.0;
        for i in 0..3 {
            sgd.zero_grad();
            let loss = quadratic_loss(&p, 100.0);
            loss.backward().unwrap();
            sgd.step().unwrap();
            let now = p.data()[[0]];
            let step = now - last;
            if i > 0 {
                assert!(step > previous_step, "momentum should grow the step");
            }
            previous_step = step;
            last = now;
        }
    }
}
