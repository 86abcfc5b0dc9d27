//! # Tensor Module
//!
//! Defines the core `Tensor` struct: an `ndarray`-backed value with optional
//! gradient tracking, plus the reverse-mode autograd machinery in
//! [`autograd`] and the differentiable operations in [`ops`].
//!
//! Cloning a `Tensor` is cheap and shares both the data buffer and the
//! gradient slot, so a clone is another handle onto the same graph node.
//! This identity matters: optimizers hold clones of the parameters they
//! update, and mutations through one handle are visible through all others.

use std::sync::{Arc, Mutex, RwLock};
use ndarray::{ArrayD, IxDyn};

pub mod ops;
pub mod autograd;

pub use autograd::{AutogradContext, BackwardOp};

/// Element type used throughout the crate.
pub type TensorData = f32;

#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Incompatible shapes for operation {op}: {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        op: String,
        shape1: Vec<usize>,
        shape2: Vec<usize>,
    },
    #[error("Tensor with {size} elements is not a scalar")]
    NotScalar { size: usize },
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
    #[error("Autograd error: {0}")]
    AutogradError(String),
    #[error("Generic error: {0}")]
    Generic(String),
}

/// A numeric array with optional reverse-mode gradient tracking.
///
/// Data lives behind `Arc<RwLock<..>>` so handles can be shared across the
/// computation graph; the gradient slot is likewise shared so that leaf
/// gradients accumulated during `backward` are visible through every handle
/// (in particular to the optimizer that owns a clone of the parameter).
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Arc<RwLock<ArrayD<TensorData>>>,
    shape: Vec<usize>,
    // Accumulated gradient for leaf tensors. None until a backward pass
    // reaches this tensor.
    grad: Arc<Mutex<Option<ArrayD<TensorData>>>>,
    // Present on tensors produced by an operation; links into the graph.
    grad_context: Option<Arc<Mutex<AutogradContext>>>,
    requires_grad: bool,
    is_leaf: bool,
}

impl Tensor {
    /// Creates a new leaf tensor from an `ndarray::ArrayD`.
    pub fn new(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            data: Arc::new(RwLock::new(data)),
            shape,
            grad: Arc::new(Mutex::new(None)),
            grad_context: None,
            requires_grad,
            is_leaf: true,
        }
    }

    /// Creates a non-leaf tensor (the result of an operation).
    pub(crate) fn from_op(
        data: ArrayD<TensorData>,
        grad_context: Arc<Mutex<AutogradContext>>,
    ) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            data: Arc::new(RwLock::new(data)),
            shape,
            grad: Arc::new(Mutex::new(None)),
            grad_context: Some(grad_context),
            requires_grad: true,
            is_leaf: false,
        }
    }

    /// Creates a 1-D tensor from a `Vec`.
    pub fn from_vec(values: Vec<TensorData>, requires_grad: bool) -> Self {
        let len = values.len();
        let data = ArrayD::from_shape_vec(IxDyn(&[len]), values)
            .expect("1-D shape always matches its own length");
        Tensor::new(data, requires_grad)
    }

    /// Creates a 0-dimensional (scalar) tensor.
    pub fn scalar(value: TensorData, requires_grad: bool) -> Self {
        Tensor::new(ArrayD::from_elem(IxDyn(&[]), value), requires_grad)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// True when the tensor holds exactly one element.
    pub fn is_scalar(&self) -> bool {
        self.size() == 1
    }

    /// Extracts the value of a one-element tensor as a plain number.
    pub fn item(&self) -> Result<TensorData, TensorError> {
        if !self.is_scalar() {
            return Err(TensorError::NotScalar { size: self.size() });
        }
        Ok(self.data().sum())
    }

    /// Read access to the underlying data.
    pub fn data(&self) -> std::sync::RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.data.read().expect("Tensor data RwLock poisoned")
    }

    /// Mutable access to the underlying data. Writes through this handle do
    /// not record anything on the computation graph; optimizers use it to
    /// apply in-place parameter updates.
    pub fn data_mut(&self) -> std::sync::RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.data.write().expect("Tensor data RwLock poisoned")
    }

    /// Clones the underlying data into a new `ArrayD`.
    pub fn data_clone(&self) -> ArrayD<TensorData> {
        self.data().clone()
    }

    /// Returns a tensor sharing this one's data but severed from the
    /// computation graph: no context, no gradient requirement.
    pub fn detach(&self) -> Self {
        Tensor {
            data: Arc::clone(&self.data),
            shape: self.shape.clone(),
            grad: Arc::new(Mutex::new(None)),
            grad_context: None,
            requires_grad: false,
            is_leaf: true,
        }
    }

    /// True when both handles point at the same data buffer.
    pub fn shares_storage(a: &Tensor, b: &Tensor) -> bool {
        Arc::ptr_eq(&a.data, &b.data)
    }

    /// Identity of the data buffer, used by optimizers to key per-parameter
    /// state so that clones of a parameter map to one entry.
    pub(crate) fn storage_ptr(&self) -> usize {
        Arc::as_ptr(&self.data) as *const () as usize
    }

    /// Accumulates a gradient into this tensor's gradient slot.
    pub(crate) fn accumulate_grad(&self, incoming: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Ok(());
        }
        if self.shape() != incoming.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: incoming.shape().to_vec(),
            });
        }
        let mut slot = self.grad.lock().expect("Gradient Mutex poisoned");
        match slot.as_mut() {
            Some(grad) => *grad += incoming,
            None => *slot = Some(incoming.clone()),
        }
        Ok(())
    }

    /// The accumulated gradient, if any, as a detached tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad
            .lock()
            .expect("Gradient Mutex poisoned")
            .as_ref()
            .map(|g| Tensor::new(g.clone(), false))
    }

    /// The accumulated gradient as a raw array, for optimizer internals.
    pub(crate) fn grad_array(&self) -> Option<ArrayD<TensorData>> {
        self.grad.lock().expect("Gradient Mutex poisoned").clone()
    }

    /// Zeroes the gradient if one exists. Optimizers call this before each
    /// backward pass; a gradient that was never computed stays absent.
    pub fn zero_grad(&self) {
        if let Some(grad) = self.grad.lock().expect("Gradient Mutex poisoned").as_mut() {
            grad.fill(0.0);
        }
    }

    /// Runs the backward pass from this tensor, seeding its gradient with
    /// ones. Only scalar roots are supported.
    pub fn backward(&self) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Err(TensorError::AutogradError(
                "cannot call backward on a tensor that does not require grad".to_string(),
            ));
        }
        if !self.is_scalar() {
            return Err(TensorError::AutogradError(
                "backward is only supported for scalar tensors".to_string(),
            ));
        }
        let seed = ArrayD::ones(IxDyn(&self.shape));
        autograd::backward(self, seed)
    }
}

// Operator overloads delegate to the ops module; results carry graph context.
use std::ops::{Add, Div, Mul, Sub};

impl Add<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;
    fn add(self, other: &Tensor) -> Self::Output {
        ops::add(self, other)
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;
    fn sub(self, other: &Tensor) -> Self::Output {
        ops::sub(self, other)
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;
    fn mul(self, other: &Tensor) -> Self::Output {
        ops::mul(self, other)
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;
    fn div(self, other: &Tensor) -> Self::Output {
        ops::div(self, other)
    }
}

// --- Construction helpers ---

/// Tensor filled with zeros.
pub fn zeros(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
}

/// Tensor filled with ones.
pub fn ones(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::ones(IxDyn(shape)), requires_grad)
}

/// Tensor filled with a constant.
pub fn full(shape: &[usize], value: TensorData, requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::from_elem(IxDyn(shape), value), requires_grad)
}

/// Tensor with values drawn uniformly from `[0, 1)`.
pub fn rand(shape: &[usize], requires_grad: bool) -> Tensor {
    use ndarray::Array;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    let data = Array::random(IxDyn(shape), Uniform::new(0.0, 1.0));
    Tensor::new(data, requires_grad)
}

/// Tensor with values drawn from the standard normal distribution.
pub fn randn(shape: &[usize], requires_grad: bool) -> Tensor {
    use ndarray::Array;
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;

    let data = Array::random(IxDyn(shape), StandardNormal);
    Tensor::new(data, requires_grad)
}

/// Like [`randn`] but reproducible, for experiments and tests.
pub fn randn_from_seed(shape: &[usize], requires_grad: bool, seed: u64) -> Tensor {
    use ndarray::Array;
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;
    use rand::{rngs::StdRng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let data = Array::random_using(IxDyn(shape), StandardNormal, &mut rng);
    Tensor::new(data, requires_grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn from_vec_shape_and_size() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0], false);
        assert_eq!(t.shape(), &[3]);
        assert_eq!(t.size(), 3);
        assert!(!t.is_scalar());
    }

    #[test]
    fn item_on_scalar_and_non_scalar() {
        let s = Tensor::scalar(2.5, false);
        assert_relative_eq!(s.item().unwrap(), 2.5);

        let v = Tensor::from_vec(vec![1.0, 2.0], false);
        assert!(matches!(v.item(), Err(TensorError::NotScalar { size: 2 })));
    }

    #[test]
    fn clone_shares_storage_and_gradient() {
        let a = Tensor::from_vec(vec![1.0, 2.0], true);
        let b = a.clone();
        assert!(Tensor::shares_storage(&a, &b));

        a.accumulate_grad(&ArrayD::from_elem(IxDyn(&[2]), 1.5)).unwrap();
        let grad_via_clone = b.grad().expect("gradient visible through clone");
        assert_relative_eq!(grad_via_clone.data()[[0]], 1.5);
    }

    #[test]
    fn detach_shares_data_but_drops_tracking() {
        let a = Tensor::from_vec(vec![1.0], true);
        let d = a.detach();
        assert!(Tensor::shares_storage(&a, &d));
        assert!(!d.requires_grad());
        assert!(d.is_leaf());
        assert!(d.grad().is_none());
    }

    #[test]
    fn zero_grad_clears_accumulated_gradient() {
        let a = Tensor::from_vec(vec![1.0, 1.0], true);
        a.accumulate_grad(&ArrayD::from_elem(IxDyn(&[2]), 3.0)).unwrap();
        a.zero_grad();
        let grad = a.grad().unwrap();
        assert_relative_eq!(grad.data()[[0]], 0.0);
        assert_relative_eq!(grad.data()[[1]], 0.0);
    }

    #[test]
    fn randn_from_seed_is_reproducible() {
        let a = randn_from_seed(&[4], false, 42);
        let b = randn_from_seed(&[4], false, 42);
        assert_eq!(a.data_clone(), b.data_clone());
        assert_eq!(a.shape(), &[4]);
    }
}
