//! # Automatic Differentiation (Autograd)
//!
//! Reverse-mode differentiation over the computation graph recorded by the
//! operations in [`super::ops`]. Each non-leaf tensor carries an
//! [`AutogradContext`] naming the backward rule for the operation that
//! produced it and holding clones of its input tensors; `backward` walks the
//! graph in topological order and accumulates gradients into leaf tensors.
//!
//! Gradients are plain `ArrayD` values, not tensors: the backward pass does
//! not itself record a graph, so second-order derivatives are out of scope.

use super::{Tensor, TensorData, TensorError};
use ndarray::ArrayD;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Backward rule for one operation.
///
/// `Send + Sync + 'static` so contexts can be stored as `Box<dyn BackwardOp>`
/// and moved across threads with the tensors that own them.
pub trait BackwardOp: Debug + Send + Sync + 'static {
    /// Computes the gradients with respect to the operation's inputs.
    ///
    /// `inputs` are clones of the tensors used in the forward pass, in
    /// order; `output_grad` is the gradient flowing into the operation's
    /// output. Must return exactly one gradient per input.
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError>;
}

/// Graph node recorded for the output tensor of one operation.
#[derive(Debug)]
pub struct AutogradContext {
    op: Box<dyn BackwardOp>,
    // Clones of the forward inputs. Cloning a Tensor only bumps Arcs, and
    // holding full clones (rather than weak refs) keeps the upstream graph
    // alive for as long as any downstream result is.
    inputs: Vec<Tensor>,
    // Gradient accumulated for this node's output so far. Taken (reset to
    // None) when the node is executed.
    accumulated: Option<ArrayD<TensorData>>,
}

impl AutogradContext {
    pub(crate) fn new(inputs: Vec<Tensor>, op: Box<dyn BackwardOp>) -> Self {
        AutogradContext {
            op,
            inputs,
            accumulated: None,
        }
    }

    /// Adds a gradient contribution for this node's output. Contributions
    /// sum when the output feeds several downstream operations.
    fn accumulate_output(&mut self, grad: ArrayD<TensorData>) -> Result<(), TensorError> {
        match self.accumulated.as_mut() {
            Some(acc) => {
                if acc.shape() != grad.shape() {
                    return Err(TensorError::ShapeMismatch {
                        expected: acc.shape().to_vec(),
                        got: grad.shape().to_vec(),
                    });
                }
                *acc += &grad;
            }
            None => self.accumulated = Some(grad),
        }
        Ok(())
    }
}

/// Performs the backward pass from `root`, seeding its gradient with `seed`.
pub fn backward(root: &Tensor, seed: ArrayD<TensorData>) -> Result<(), TensorError> {
    if !root.requires_grad() {
        return Ok(());
    }

    let root_ctx = match &root.grad_context {
        Some(ctx) => Arc::clone(ctx),
        // A leaf root's gradient is the seed itself.
        None => return root.accumulate_grad(&seed),
    };

    root_ctx
        .lock()
        .expect("AutogradContext Mutex poisoned")
        .accumulate_output(seed)?;

    // Topological order guarantees a node runs only after every gradient
    // contribution into it has been accumulated, which a plain FIFO
    // traversal does not on diamond-shaped graphs.
    for ctx_arc in topological_order(&root_ctx) {
        let (inputs, input_grads) = {
            let mut ctx = ctx_arc.lock().expect("AutogradContext Mutex poisoned");
            let output_grad = match ctx.accumulated.take() {
                Some(grad) => grad,
                // Reachable node that no gradient flowed into; nothing to do.
                None => continue,
            };
            let grads = ctx.op.backward(&ctx.inputs, &output_grad)?;
            if grads.len() != ctx.inputs.len() {
                return Err(TensorError::AutogradError(format!(
                    "backward op {:?} produced {} gradients for {} inputs",
                    ctx.op,
                    grads.len(),
                    ctx.inputs.len()
                )));
            }
            (ctx.inputs.clone(), grads)
        };

        for (input, grad) in inputs.iter().zip(input_grads) {
            if !input.requires_grad() {
                continue;
            }
            match &input.grad_context {
                // Interior node: route the gradient to its context.
                Some(next_ctx) => next_ctx
                    .lock()
                    .expect("AutogradContext Mutex poisoned")
                    .accumulate_output(grad)?,
                // Leaf: accumulate into the tensor's gradient slot.
                None => input.accumulate_grad(&grad)?,
            }
        }
    }

    Ok(())
}

/// Reverse postorder (root first) over the context DAG, by iterative DFS.
fn topological_order(root: &Arc<Mutex<AutogradContext>>) -> Vec<Arc<Mutex<AutogradContext>>> {
    let mut order = Vec::new();
    let mut visited: HashSet<usize> = HashSet::new();
    // (node, children already pushed)
    let mut stack = vec![(Arc::clone(root), false)];

    while let Some((ctx_arc, expanded)) = stack.pop() {
        if expanded {
            order.push(ctx_arc);
            continue;
        }
        let key = Arc::as_ptr(&ctx_arc) as *const () as usize;
        if !visited.insert(key) {
            continue;
        }
        stack.push((Arc::clone(&ctx_arc), true));
        let ctx = ctx_arc.lock().expect("AutogradContext Mutex poisoned");
        for input in &ctx.inputs {
            if let Some(child) = &input.grad_context {
                let child_key = Arc::as_ptr(child) as *const () as usize;
                if !visited.contains(&child_key) {
                    stack.push((Arc::clone(child), false));
                }
            }
        }
    }

    order.reverse();
    order
}

// --- Concrete backward rules ---

pub mod op_abstractions {
    use super::*;
    use crate::tensor::ops::elementwise;
    use ndarray::IxDyn;

    /// Reduces a gradient back to the shape of the input it belongs to.
    /// Only the one-element-tensor broadcast performed by the forward ops
    /// needs reversing: everything else must already match.
    fn reduce_to_shape(
        grad: ArrayD<TensorData>,
        target: &[usize],
    ) -> Result<ArrayD<TensorData>, TensorError> {
        if grad.shape() == target {
            return Ok(grad);
        }
        if target.iter().product::<usize>() == 1 {
            return Ok(ArrayD::from_elem(IxDyn(target), grad.sum()));
        }
        Err(TensorError::AutogradError(format!(
            "cannot reduce gradient of shape {:?} to input shape {:?}",
            grad.shape(),
            target
        )))
    }

    #[derive(Debug)]
    pub struct AddBackward;
    impl BackwardOp for AddBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            Ok(vec![
                reduce_to_shape(output_grad.clone(), inputs[0].shape())?,
                reduce_to_shape(output_grad.clone(), inputs[1].shape())?,
            ])
        }
    }

    #[derive(Debug)]
    pub struct SubBackward;
    impl BackwardOp for SubBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            Ok(vec![
                reduce_to_shape(output_grad.clone(), inputs[0].shape())?,
                reduce_to_shape(output_grad.mapv(|g| -g), inputs[1].shape())?,
            ])
        }
    }

    #[derive(Debug)]
    pub struct MulBackward;
    impl BackwardOp for MulBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let a = inputs[0].data();
            let b = inputs[1].data();
            let grad_a = elementwise(output_grad, &b, |g, y| g * y);
            let grad_b = elementwise(output_grad, &a, |g, x| g * x);
            Ok(vec![
                reduce_to_shape(grad_a, inputs[0].shape())?,
                reduce_to_shape(grad_b, inputs[1].shape())?,
            ])
        }
    }

    #[derive(Debug)]
    pub struct DivBackward;
    impl BackwardOp for DivBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let a = inputs[0].data();
            let b = inputs[1].data();
            // d(a/b)/da = 1/b, d(a/b)/db = -a/b^2
            let grad_a = elementwise(output_grad, &b, |g, y| g / y);
            let neg_a_over_b_sq = elementwise(&a, &b, |x, y| -x / (y * y));
            let grad_b = elementwise(output_grad, &neg_a_over_b_sq, |g, v| g * v);
            Ok(vec![
                reduce_to_shape(grad_a, inputs[0].shape())?,
                reduce_to_shape(grad_b, inputs[1].shape())?,
            ])
        }
    }

    #[derive(Debug)]
    pub struct AddScalarBackward;
    impl BackwardOp for AddScalarBackward {
        fn backward(
            &self,
            _inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            Ok(vec![output_grad.clone()])
        }
    }

    #[derive(Debug)]
    pub struct MulScalarBackward {
        scalar: TensorData,
    }
    impl MulScalarBackward {
        pub fn new(scalar: TensorData) -> Self {
            Self { scalar }
        }
    }
    impl BackwardOp for MulScalarBackward {
        fn backward(
            &self,
            _inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            Ok(vec![output_grad * self.scalar])
        }
    }

    #[derive(Debug)]
    pub struct NegBackward;
    impl BackwardOp for NegBackward {
        fn backward(
            &self,
            _inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            Ok(vec![output_grad.mapv(|g| -g)])
        }
    }

    #[derive(Debug)]
    pub struct SqrtBackward;
    impl BackwardOp for SqrtBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let a = inputs[0].data();
            // d(sqrt(a))/da = 1 / (2 sqrt(a))
            let grad = elementwise(output_grad, &a, |g, x| 0.5 * g / x.sqrt());
            Ok(vec![grad])
        }
    }

    #[derive(Debug)]
    pub struct PowiBackward {
        exponent: i32,
    }
    impl PowiBackward {
        pub fn new(exponent: i32) -> Self {
            Self { exponent }
        }
    }
    impl BackwardOp for PowiBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let a = inputs[0].data();
            let n = self.exponent;
            let grad = elementwise(output_grad, &a, |g, x| g * n as TensorData * x.powi(n - 1));
            Ok(vec![grad])
        }
    }

    #[derive(Debug)]
    pub struct SinBackward;
    impl BackwardOp for SinBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let a = inputs[0].data();
            let grad = elementwise(output_grad, &a, |g, x| g * x.cos());
            Ok(vec![grad])
        }
    }

    #[derive(Debug)]
    pub struct CosBackward;
    impl BackwardOp for CosBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let a = inputs[0].data();
            let grad = elementwise(output_grad, &a, |g, x| -g * x.sin());
            Ok(vec![grad])
        }
    }

    #[derive(Debug)]
    pub struct SumBackward {
        input_shape: Vec<usize>,
    }
    impl SumBackward {
        pub fn new(input_shape: Vec<usize>) -> Self {
            Self { input_shape }
        }
    }
    impl BackwardOp for SumBackward {
        fn backward(
            &self,
            _inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            // Scalar gradient broadcast back over the summed elements.
            Ok(vec![ArrayD::from_elem(
                IxDyn(&self.input_shape),
                output_grad.sum(),
            )])
        }
    }

    #[derive(Debug)]
    pub struct MeanBackward {
        input_shape: Vec<usize>,
    }
    impl MeanBackward {
        pub fn new(input_shape: Vec<usize>) -> Self {
            Self { input_shape }
        }
    }
    impl BackwardOp for MeanBackward {
        fn backward(
            &self,
            _inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let count: usize = self.input_shape.iter().product();
            let scale = if count == 0 {
                0.0
            } else {
                1.0 / count as TensorData
            };
            Ok(vec![ArrayD::from_elem(
                IxDyn(&self.input_shape),
                output_grad.sum() * scale,
            )])
        }
    }

    #[derive(Debug)]
    pub struct DotBackward;
    impl BackwardOp for DotBackward {
        fn backward(
            &self,
            inputs: &[Tensor],
            output_grad: &ArrayD<TensorData>,
        ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            // d(a . b)/da = g * b, d(a . b)/db = g * a, g scalar.
            let g = output_grad.sum();
            let grad_a = &*inputs[1].data() * g;
            let grad_b = &*inputs[0].data() * g;
            Ok(vec![grad_a, grad_b])
        }
    }
}

pub use op_abstractions::*;

#[cfg(test)]
mod tests {
    use crate::tensor::{ops, Tensor};
    use approx::assert_relative_eq;

    #[test]
    fn product_rule_and_sum_rule() {
        // y = a * b + a  =>  dy/da = b + 1, dy/db = a
        let a = Tensor::scalar(2.0, true);
        let b = Tensor::scalar(5.0, true);
        let prod = ops::mul(&a, &b).unwrap();
        let y = ops::add(&prod, &a).unwrap();
        y.backward().unwrap();

        assert_relative_eq!(a.grad().unwrap().item().unwrap(), 6.0);
        assert_relative_eq!(b.grad().unwrap().item().unwrap(), 2.0);
    }

    #[test]
    fn repeated_use_accumulates() {
        // y = a * a  =>  dy/da = 2a
        let a = Tensor::scalar(3.0, true);
        let y = ops::mul(&a, &a).unwrap();
        y.backward().unwrap();
        assert_relative_eq!(a.grad().unwrap().item().unwrap(), 6.0);
    }

    #[test]
    fn diamond_graph_gets_complete_gradients() {
        // y = (a + b) * (a - b)  =>  dy/da = 2a, dy/db = -2b
        let a = Tensor::scalar(4.0, true);
        let b = Tensor::scalar(1.5, true);
        let sum = ops::add(&a, &b).unwrap();
        let diff = ops::sub(&a, &b).unwrap();
        let y = ops::mul(&sum, &diff).unwrap();
        y.backward().unwrap();

        assert_relative_eq!(a.grad().unwrap().item().unwrap(), 8.0);
        assert_relative_eq!(b.grad().unwrap().item().unwrap(), -3.0);
    }

    #[test]
    fn backward_requires_scalar_root() {
        let a = Tensor::from_vec(vec![1.0, 2.0], true);
        let y = ops::add(&a, &a).unwrap();
        assert!(y.backward().is_err());
    }

    #[test]
    fn no_gradient_flows_into_untracked_inputs() {
        let a = Tensor::scalar(2.0, true);
        let c = Tensor::scalar(10.0, false);
        let y = ops::mul(&a, &c).unwrap();
        y.backward().unwrap();
        assert_relative_eq!(a.grad().unwrap().item().unwrap(), 10.0);
        assert!(c.grad().is_none());
    }
}
