//! # Optimization Algorithms (`optim`)
//!
//! Stateful first-order optimizers ([`Adam`], [`Sgd`]) that update parameter
//! tensors in place from their accumulated gradients, and the
//! [`VariationalOptimizer`] capability consumed by iterative drivers: one
//! `step_and_cost` call evaluates a cost function, backpropagates, and
//! applies a single update.

use crate::tensor::{Tensor, TensorData, TensorError};

pub mod sgd;
pub mod adam;
pub mod step_and_cost;

pub use adam::Adam;
pub use sgd::Sgd;
pub use step_and_cost::AdamStepOptimizer;

/// Base trait for parameter-updating optimizers.
pub trait Optimizer {
    /// Performs a single update step using the gradients currently
    /// accumulated on the managed parameters. Parameters without a gradient
    /// are skipped.
    fn step(&mut self) -> Result<(), TensorError>;

    /// Zeroes the gradients of all managed parameters. Call before each new
    /// backward pass so gradients do not accumulate across iterations.
    fn zero_grad(&mut self);
}

/// A scalar cost evaluated on a differentiable parameter tensor.
pub type CostFunction<'a> = dyn Fn(&Tensor) -> Result<Tensor, TensorError> + 'a;

/// A self-contained optimization problem: a cost landscape plus a starting
/// point. This is the capability a full optimization run would consume.
pub trait Problem {
    /// Evaluates the cost at `theta`, returning a scalar tensor.
    fn evaluate(&self, theta: &Tensor) -> Result<Tensor, TensorError>;

    /// The initial parameter value for a fresh run.
    fn initial_point(&self) -> Tensor;
}

/// Single-step optimizer capability used inside an iterative optimization
/// cycle. Implementations own their parameter tensor after the first
/// `step_and_cost` call.
pub trait VariationalOptimizer {
    /// Runs one optimization step: clears gradients, evaluates
    /// `cost_function` on the owned parameter, backpropagates, applies the
    /// update, and returns the detached updated parameter together with the
    /// cost value measured before the update.
    ///
    /// `theta` is adopted on the first call; later calls reuse the adopted
    /// tensor and ignore the argument.
    fn step_and_cost(
        &mut self,
        cost_function: &CostFunction<'_>,
        theta: &Tensor,
    ) -> Result<(Tensor, TensorData), TensorError>;

    /// Runs a complete optimization on `problem`. Not every implementation
    /// supports this entry point; single-step adapters return
    /// [`TensorError::Unsupported`].
    fn optimize(&mut self, problem: &dyn Problem)
        -> Result<(Tensor, TensorData), TensorError>;
}
