//! # varopt
//!
//! Variational parameter optimization: differentiable tensors with
//! reverse-mode autograd, stateful first-order optimizers (Adam, SGD), and a
//! step-and-cost adapter that drives one optimization step per call inside
//! an external iteration loop.
//!
//! ```
//! use varopt::optim::{AdamStepOptimizer, VariationalOptimizer};
//! use varopt::tensor::{ops, Tensor};
//!
//! let mut adapter = AdamStepOptimizer::new(0.01);
//! let theta = Tensor::from_vec(vec![0.0], true);
//! let cost = |t: &Tensor| {
//!     let shifted = ops::sub_scalar(t, 3.0)?;
//!     ops::sum(&ops::mul(&shifted, &shifted)?)
//! };
//! let (updated, value) = adapter.step_and_cost(&cost, &theta).unwrap();
//! assert!((value - 9.0).abs() < 1e-4);
//! assert!(updated.data()[[0]] > 0.0);
//! ```

pub mod tensor;
pub mod optim;

pub use tensor::{Tensor, TensorData, TensorError};
