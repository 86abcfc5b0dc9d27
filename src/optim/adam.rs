//! # Adam Optimizer

use super::Optimizer;
use crate::tensor::{Tensor, TensorData, TensorError};
use log::trace;
use ndarray::{ArrayD, IxDyn, Zip};
use std::collections::HashMap;

/// Implements the Adam algorithm.
/// Reference: Adam: A Method for Stochastic Optimization - https://arxiv.org/abs/1412.6980
pub struct Adam {
    params: Vec<Tensor>,
    lr: TensorData,
    betas: (TensorData, TensorData),
    eps: TensorData,
    weight_decay: TensorData,
    amsgrad: bool,

    // Moment state per parameter, keyed by storage identity so clones of a
    // parameter share one entry.
    state: HashMap<usize, AdamParamState>,
    // Step count; drives bias correction.
    t: i32,
}

#[derive(Clone, Debug)]
struct AdamParamState {
    exp_avg: ArrayD<TensorData>,    // 1st moment estimate, m_t
    exp_avg_sq: ArrayD<TensorData>, // 2nd moment estimate, v_t
    max_exp_avg_sq: Option<ArrayD<TensorData>>, // running max of v_t, amsgrad only
}

impl Adam {
    /// Creates a new Adam optimizer instance.
    ///
    /// # Arguments
    /// * `params`: The parameters to optimize.
    /// * `lr`: Learning rate (default: 1e-3).
    /// * `betas`: Running-average coefficients for the gradient and its square (default: (0.9, 0.999)).
    /// * `eps`: Denominator term for numerical stability (default: 1e-8).
    /// * `weight_decay`: L2 penalty (default: 0).
    /// * `amsgrad`: Use the AMSGrad variant (default: false).
    pub fn new<I>(
        params: I,
        lr: Option<TensorData>,
        betas: Option<(TensorData, TensorData)>,
        eps: Option<TensorData>,
        weight_decay: Option<TensorData>,
        amsgrad: bool,
    ) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        let params_vec: Vec<Tensor> = params.into_iter().collect();
        let lr_val = lr.unwrap_or(1e-3);
        let betas_val = betas.unwrap_or((0.9, 0.999));
        let eps_val = eps.unwrap_or(1e-8);
        let weight_decay_val = weight_decay.unwrap_or(0.0);

        if lr_val < 0.0 {
            return Err(TensorError::Generic(
                "Invalid learning rate: must be >= 0".into(),
            ));
        }
        if eps_val < 0.0 {
            return Err(TensorError::Generic(
                "Invalid epsilon value: must be >= 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&betas_val.0) {
            return Err(TensorError::Generic(
                "Invalid beta parameter at index 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&betas_val.1) {
            return Err(TensorError::Generic(
                "Invalid beta parameter at index 1".into(),
            ));
        }
        if weight_decay_val < 0.0 {
            return Err(TensorError::Generic(
                "Invalid weight_decay value: must be >= 0".into(),
            ));
        }

        Ok(Adam {
            params: params_vec,
            lr: lr_val,
            betas: betas_val,
            eps: eps_val,
            weight_decay: weight_decay_val,
            amsgrad,
            state: HashMap::new(),
            t: 0,
        })
    }

    /// Convenience constructor with defaults for everything but the
    /// learning rate.
    pub fn with_lr<I>(params: I, lr: TensorData) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::new(params, Some(lr), None, None, None, false)
    }

    pub fn lr(&self) -> TensorData {
        self.lr
    }
}

impl Optimizer for Adam {
    fn step(&mut self) -> Result<(), TensorError> {
        self.t += 1;
        let (beta1, beta2) = self.betas;
        let weight_decay = self.weight_decay;
        let eps = self.eps;
        let amsgrad = self.amsgrad;

        let bias_correction1 = 1.0 - beta1.powi(self.t);
        let bias_correction2 = 1.0 - beta2.powi(self.t);
        // PyTorch folds both corrections into the step size.
        let step_size = self.lr * bias_correction2.sqrt() / bias_correction1;
        trace!("Adam: step t={} step_size={}", self.t, step_size);

        for param in &self.params {
            if !param.requires_grad() {
                continue;
            }
            let mut grad = match param.grad_array() {
                Some(g) => g,
                None => continue,
            };

            if weight_decay != 0.0 {
                grad = grad + &*param.data() * weight_decay;
            }

            let state = self
                .state
                .entry(param.storage_ptr())
                .or_insert_with(|| AdamParamState {
                    exp_avg: ArrayD::zeros(IxDyn(param.shape())),
                    exp_avg_sq: ArrayD::zeros(IxDyn(param.shape())),
                    max_exp_avg_sq: if amsgrad {
                        Some(ArrayD::zeros(IxDyn(param.shape())))
                    } else {
                        None
                    },
                });

            // m_t = beta1 * m_{t-1} + (1 - beta1) * g_t
            state.exp_avg = &state.exp_avg * beta1 + &grad * (1.0 - beta1);
            // v_t = beta2 * v_{t-1} + (1 - beta2) * g_t^2
            state.exp_avg_sq =
                &state.exp_avg_sq * beta2 + (&grad * &grad) * (1.0 - beta2);

            let second_moment = if amsgrad {
                let current = state.exp_avg_sq.clone();
                let max_sq = state
                    .max_exp_avg_sq
                    .get_or_insert_with(|| ArrayD::zeros(IxDyn(param.shape())));
                Zip::from(&mut *max_sq).and(&current).for_each(|m, &v| {
                    if v > *m {
                        *m = v;
                    }
                });
                max_sq.clone()
            } else {
                state.exp_avg_sq.clone()
            };

            // param -= step_size * m_t / (sqrt(v_t) + eps)
            let update = Zip::from(&state.exp_avg)
                .and(&second_moment)
                .map_collect(|&m, &v| step_size * m / (v.sqrt() + eps));
            {
                let mut data = param.data_mut();
                *data -= &update;
            }
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

    fn quadratic_loss(param: &Tensor, target: TensorData) -> Tensor {
        let shifted = ops::sub_scalar(param, target).unwrap();
        let squared = ops::mul(&shifted, &shifted).unwrap();
        ops::sum(&squared).unwrap()
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        let p = Tensor::from_vec(vec![0.0], true);
        assert!(Adam::new(vec![p.clone()], Some(-0.1), None, None, None, false).is_err());
        assert!(Adam::new(vec![p.clone()], None, Some((1.0, 0.999)), None, None, false).is_err());
        assert!(Adam::new(vec![p.clone()], None, None, Some(-1e-8), None, false).is_err());
        assert!(Adam::new(vec![p], None, None, None, Some(-0.1), false).is_err());
    }

    #[test]
    fn first_step_magnitude_is_close_to_lr() {
        let p = Tensor::from_vec(vec![0.0], true);
        let mut adam = Adam::with_lr(vec![p.clone()], 0.01).unwrap();

        adam.zero_grad();
        let loss = quadratic_loss(&p, 3.0);
        loss.backward().unwrap();
        adam.step().unwrap();

        // With bias correction, the first step is ~lr in the gradient's
        // descent direction regardless of the gradient magnitude.
        let value = p.data()[[0]];
        assert!(value > 0.005 && value < 0.015, "value = {value}");
    }

    #[test]
    fn step_without_gradient_is_a_no_op_for_that_param() {
        let p = Tensor::from_vec(vec![1.0], true);
        let mut adam = Adam::with_lr(vec![p.clone()], 0.1).unwrap();
        adam.step().unwrap();
        assert_eq!(p.data()[[0]], 1.0);
    }

    #[test]
    fn repeated_steps_descend_a_quadratic() {
        let p = Tensor::from_vec(vec![0.0, 0.0], true);
        let mut adam = Adam::with_lr(vec![p.clone()], 0.05).unwrap();

        for _ in 0..200 {
            adam.zero_grad();
            let loss = quadratic_loss(&p, 1.0);
            loss.backward().unwrap();
            adam.step().unwrap();
        }
        let final_cost = quadratic_loss(&p, 1.0).item().unwrap();
        assert!(final_cost < 0.05, "cost = {final_cost}");
        assert!((p.data()[[0]] - 1.0).abs() < 0.2);
    }

    #[test]
    fn amsgrad_variant_steps() {
        let p = Tensor::from_vec(vec![0.0], true);
        let mut adam =
            Adam::new(vec![p.clone()], Some(0.01), None, None, None, true).unwrap();
        adam.zero_grad();
        let loss = quadratic_loss(&p, 3.0);
        loss.backward().unwrap();
        adam.step().unwrap();
        assert!(p.data()[[0]] > 0.0);
    }
}
