//! # Step-and-Cost Adapter
//!
//! [`AdamStepOptimizer`] bridges a cost function and a parameter tensor to
//! the stateful [`Adam`] optimizer, one step at a time. An iterative driver
//! calls `step_and_cost` repeatedly; the adapter owns the parameter and the
//! optimizer after the first call and returns the detached parameter plus
//! the scalar cost from each step.

use super::{Adam, CostFunction, Optimizer, Problem, VariationalOptimizer};
use crate::tensor::{Tensor, TensorData, TensorError};
use log::{debug, trace};

/// Drives single Adam steps over a caller-supplied cost function.
///
/// The parameter tensor passed to the first `step_and_cost` call is adopted
/// for the adapter's whole lifetime; the underlying [`Adam`] instance is
/// constructed at the same moment, bound to that tensor with the learning
/// rate given at construction. The `theta` argument of later calls is
/// ignored.
pub struct AdamStepOptimizer {
    lr: TensorData,
    state: Option<AdapterState>,
}

struct AdapterState {
    theta: Tensor,
    optimizer: Adam,
}

impl AdamStepOptimizer {
    /// Stores the learning rate; the optimizer itself is built lazily on
    /// the first `step_and_cost` call.
    pub fn new(lr: TensorData) -> Self {
        AdamStepOptimizer { lr, state: None }
    }

    pub fn lr(&self) -> TensorData {
        self.lr
    }

    /// Whether the parameter has been adopted yet.
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }
}

impl VariationalOptimizer for AdamStepOptimizer {
    fn step_and_cost(
        &mut self,
        cost_function: &CostFunction<'_>,
        theta: &Tensor,
    ) -> Result<(Tensor, TensorData), TensorError> {
        if self.state.is_none() {
            debug!(
                "AdamStepOptimizer: adopting parameter (shape {:?}), building Adam with lr={}",
                theta.shape(),
                self.lr
            );
            let optimizer = Adam::with_lr(vec![theta.clone()], self.lr)?;
            self.state = Some(AdapterState {
                theta: theta.clone(),
                optimizer,
            });
        } else if let Some(state) = &self.state {
            if !Tensor::shares_storage(&state.theta, theta) {
                debug!(
                    "AdamStepOptimizer: theta argument ignored; the parameter was adopted on the first call"
                );
            }
        }
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| TensorError::Generic("adapter state not initialized".to_string()))?;

        // Zero out gradients, evaluate, backpropagate, step.
        state.optimizer.zero_grad();
        let cost = cost_function(&state.theta)?;
        cost.backward()?;
        state.optimizer.step()?;

        // The cost reported is the evaluation before the update just applied.
        let cost_value = cost.item()?;
        trace!("AdamStepOptimizer: cost={cost_value}");
        Ok((state.theta.detach(), cost_value))
    }

    /// Full-run optimization is deliberately unsupported: this type exists
    /// to serve single steps inside an external cycle.
    fn optimize(
        &mut self,
        _problem: &dyn Problem,
    ) -> Result<(Tensor, TensorData), TensorError> {
        Err(TensorError::Unsupported(
            "AdamStepOptimizer performs single steps; call step_and_cost() from an \
             iteration loop instead of optimize()"
                .to_string(),
        ))
    }
}
