//! # Tensor Operations
//!
//! Differentiable operations on Tensors. Each operation computes its result
//! eagerly and, when any input requires grad, attaches an
//! [`AutogradContext`] carrying the matching backward rule from
//! [`super::autograd::op_abstractions`].
//!
//! Binary operations accept operands of the same shape, or one operand with
//! a single element, which broadcasts against the other; the backward pass
//! reduces the gradient back to the one-element side by summation.

use super::autograd::op_abstractions::{
    AddBackward, AddScalarBackward, CosBackward, DivBackward, DotBackward, MeanBackward,
    MulBackward, MulScalarBackward, NegBackward, PowiBackward, SinBackward, SqrtBackward,
    SubBackward, SumBackward,
};
use super::autograd::{AutogradContext, BackwardOp};
use super::{Tensor, TensorData, TensorError};
use ndarray::{ArrayD, Ix1, IxDyn, Zip};
use std::sync::{Arc, Mutex};

/// Wraps an operation result, attaching a graph context when any input
/// requires gradient computation.
fn create_op_result(
    result_data: ArrayD<TensorData>,
    inputs: Vec<Tensor>,
    backward_op: Box<dyn BackwardOp>,
) -> Tensor {
    let requires_grad = inputs.iter().any(|t| t.requires_grad());
    if requires_grad {
        let grad_context = Arc::new(Mutex::new(AutogradContext::new(inputs, backward_op)));
        Tensor::from_op(result_data, grad_context)
    } else {
        Tensor::new(result_data, false)
    }
}

/// Element-wise combination of two arrays, broadcasting a one-element
/// operand against the other. Panics never: the shape compatibility is the
/// caller's contract (checked by the public ops before entry).
pub(crate) fn elementwise<F>(
    a: &ArrayD<TensorData>,
    b: &ArrayD<TensorData>,
    f: F,
) -> ArrayD<TensorData>
where
    F: Fn(TensorData, TensorData) -> TensorData,
{
    if a.shape() == b.shape() {
        Zip::from(a).and(b).map_collect(|&x, &y| f(x, y))
    } else if b.len() == 1 {
        let s = b.sum();
        a.mapv(|x| f(x, s))
    } else {
        let s = a.sum();
        b.mapv(|y| f(s, y))
    }
}

fn check_binary_shapes(op: &str, a: &Tensor, b: &Tensor) -> Result<(), TensorError> {
    if a.shape() == b.shape() || a.is_scalar() || b.is_scalar() {
        return Ok(());
    }
    Err(TensorError::IncompatibleShapes {
        op: op.to_string(),
        shape1: a.shape().to_vec(),
        shape2: b.shape().to_vec(),
    })
}

// --- Arithmetic ---

/// Element-wise addition.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    check_binary_shapes("add", a, b)?;
    let result = elementwise(&a.data(), &b.data(), |x, y| x + y);
    Ok(create_op_result(
        result,
        vec![a.clone(), b.clone()],
        Box::new(AddBackward),
    ))
}

/// Element-wise subtraction (`a - b`).
pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    check_binary_shapes("sub", a, b)?;
    let result = {
        let a_data = a.data();
        let b_data = b.data();
        if a.shape() == b.shape() || b.is_scalar() {
            elementwise(&a_data, &b_data, |x, y| x - y)
        } else {
            // Scalar a against non-scalar b: keep operand order.
            let s = a_data.sum();
            b_data.mapv(|y| s - y)
        }
    };
    Ok(create_op_result(
        result,
        vec![a.clone(), b.clone()],
        Box::new(SubBackward),
    ))
}

/// Element-wise multiplication.
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    check_binary_shapes("mul", a, b)?;
    let result = elementwise(&a.data(), &b.data(), |x, y| x * y);
    Ok(create_op_result(
        result,
        vec![a.clone(), b.clone()],
        Box::new(MulBackward),
    ))
}

/// Element-wise division (`a / b`).
pub fn div(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    check_binary_shapes("div", a, b)?;
    let result = {
        let a_data = a.data();
        let b_data = b.data();
        if a.shape() == b.shape() || b.is_scalar() {
            elementwise(&a_data, &b_data, |x, y| x / y)
        } else {
            let s = a_data.sum();
            b_data.mapv(|y| s / y)
        }
    };
    Ok(create_op_result(
        result,
        vec![a.clone(), b.clone()],
        Box::new(DivBackward),
    ))
}

/// Adds a constant to every element.
pub fn add_scalar(a: &Tensor, scalar: TensorData) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x + scalar);
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(AddScalarBackward),
    ))
}

/// Subtracts a constant from every element.
pub fn sub_scalar(a: &Tensor, scalar: TensorData) -> Result<Tensor, TensorError> {
    add_scalar(a, -scalar)
}

/// Multiplies every element by a constant.
pub fn mul_scalar(a: &Tensor, scalar: TensorData) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x * scalar);
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(MulScalarBackward::new(scalar)),
    ))
}

/// Element-wise negation.
pub fn neg(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| -x);
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(NegBackward),
    ))
}

// --- Element-wise functions ---

/// Element-wise square root. Negative inputs produce NaN, which propagates
/// through the graph untouched.
pub fn sqrt(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x.sqrt());
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(SqrtBackward),
    ))
}

/// Element-wise integer power.
pub fn powi(a: &Tensor, exponent: i32) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x.powi(exponent));
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(PowiBackward::new(exponent)),
    ))
}

/// Element-wise sine.
pub fn sin(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x.sin());
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(SinBackward),
    ))
}

/// Element-wise cosine.
pub fn cos(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x.cos());
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(CosBackward),
    ))
}

// --- Reductions ---

/// Sums all elements into a scalar tensor.
pub fn sum(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = ArrayD::from_elem(IxDyn(&[]), a.data().sum());
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(SumBackward::new(a.shape().to_vec())),
    ))
}

/// Mean of all elements as a scalar tensor.
pub fn mean(a: &Tensor) -> Result<Tensor, TensorError> {
    if a.size() == 0 {
        return Err(TensorError::Generic(
            "cannot take the mean of an empty tensor".to_string(),
        ));
    }
    let value = a.data().sum() / a.size() as TensorData;
    let result = ArrayD::from_elem(IxDyn(&[]), value);
    Ok(create_op_result(
        result,
        vec![a.clone()],
        Box::new(MeanBackward::new(a.shape().to_vec())),
    ))
}

/// Dot product of two 1-D tensors, producing a scalar tensor.
pub fn dot(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    if a.ndim() != 1 || b.ndim() != 1 {
        return Err(TensorError::Generic(format!(
            "dot expects 1-D tensors, got {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    if a.shape()[0] != b.shape()[0] {
        return Err(TensorError::IncompatibleShapes {
            op: "dot".to_string(),
            shape1: a.shape().to_vec(),
            shape2: b.shape().to_vec(),
        });
    }
    let value = {
        let a_data = a.data();
        let b_data = b.data();
        let a_view = a_data
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(TensorError::NdarrayError)?;
        let b_view = b_data
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(TensorError::NdarrayError)?;
        a_view.dot(&b_view)
    };
    let result = ArrayD::from_elem(IxDyn(&[]), value);
    Ok(create_op_result(
        result,
        vec![a.clone(), b.clone()],
        Box::new(DotBackward),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn add_with_one_element_broadcast() {
        let v = Tensor::from_vec(vec![1.0, 2.0, 3.0], false);
        let s = Tensor::scalar(10.0, false);
        let out = add(&v, &s).unwrap();
        assert_eq!(out.shape(), &[3]);
        assert_relative_eq!(out.data()[[1]], 12.0);
    }

    #[test]
    fn incompatible_shapes_are_rejected() {
        let a = Tensor::from_vec(vec![1.0, 2.0], false);
        let b = Tensor::from_vec(vec![1.0, 2.0, 3.0], false);
        assert!(matches!(
            add(&a, &b),
            Err(TensorError::IncompatibleShapes { .. })
        ));
    }

    #[test]
    fn sub_and_div_preserve_operand_order_for_scalars() {
        let s = Tensor::scalar(10.0, false);
        let v = Tensor::from_vec(vec![2.0, 5.0], false);
        let diff = sub(&s, &v).unwrap();
        assert_relative_eq!(diff.data()[[0]], 8.0);
        let quot = div(&s, &v).unwrap();
        assert_relative_eq!(quot.data()[[1]], 2.0);
    }

    #[test]
    fn sqrt_gradient() {
        // d(sqrt(x))/dx at 4 is 1/4
        let x = Tensor::scalar(4.0, true);
        let y = sqrt(&x).unwrap();
        y.backward().unwrap();
        assert_relative_eq!(x.grad().unwrap().item().unwrap(), 0.25);
    }

    #[test]
    fn powi_gradient() {
        // d(x^3)/dx at 2 is 12
        let x = Tensor::scalar(2.0, true);
        let y = powi(&x, 3).unwrap();
        y.backward().unwrap();
        assert_relative_eq!(y.item().unwrap(), 8.0);
        assert_relative_eq!(x.grad().unwrap().item().unwrap(), 12.0);
    }

    #[test]
    fn trig_gradients() {
        // d(sin x)/dx at 0 is 1; d(cos x)/dx at 0 is 0
        let x = Tensor::scalar(0.0, true);
        let y = sin(&x).unwrap();
        y.backward().unwrap();
        assert_relative_eq!(x.grad().unwrap().item().unwrap(), 1.0);

        let z = Tensor::scalar(0.0, true);
        let w = cos(&z).unwrap();
        w.backward().unwrap();
        assert_relative_eq!(z.grad().unwrap().item().unwrap(), 0.0);
    }

    #[test]
    fn div_gradients() {
        // y = a/b: dy/da = 1/b, dy/db = -a/b^2
        let a = Tensor::scalar(6.0, true);
        let b = Tensor::scalar(2.0, true);
        let y = div(&a, &b).unwrap();
        y.backward().unwrap();
        assert_relative_eq!(a.grad().unwrap().item().unwrap(), 0.5);
        assert_relative_eq!(b.grad().unwrap().item().unwrap(), -1.5);
    }

    #[test]
    fn sum_and_mean_gradients() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], true);
        let s = sum(&x).unwrap();
        assert_relative_eq!(s.item().unwrap(), 10.0);
        s.backward().unwrap();
        let grad = x.grad().unwrap();
        assert_relative_eq!(grad.data()[[2]], 1.0);

        let y = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], true);
        let m = mean(&y).unwrap();
        assert_relative_eq!(m.item().unwrap(), 2.5);
        m.backward().unwrap();
        assert_relative_eq!(y.grad().unwrap().data()[[0]], 0.25);
    }

    #[test]
    fn dot_value_and_gradients() {
        let a = Tensor::from_vec(vec![1.0, 2.0], true);
        let b = Tensor::from_vec(vec![3.0, 4.0], true);
        let y = dot(&a, &b).unwrap();
        assert_relative_eq!(y.item().unwrap(), 11.0);
        y.backward().unwrap();
        assert_relative_eq!(a.grad().unwrap().data()[[0]], 3.0);
        assert_relative_eq!(a.grad().unwrap().data()[[1]], 4.0);
        assert_relative_eq!(b.grad().unwrap().data()[[0]], 1.0);
    }

    #[test]
    fn dot_rejects_non_1d_and_mismatched_lengths() {
        let a = Tensor::from_vec(vec![1.0, 2.0], false);
        let b = Tensor::from_vec(vec![1.0, 2.0, 3.0], false);
        assert!(dot(&a, &b).is_err());
        let s = Tensor::scalar(1.0, false);
        assert!(dot(&s, &a).is_err());
    }

    #[test]
    fn untracked_inputs_produce_untracked_outputs() {
        let a = Tensor::from_vec(vec![1.0, 2.0], false);
        let out = mul_scalar(&a, 2.0).unwrap();
        assert!(!out.requires_grad());
        assert!(out.is_leaf());
    }
}
