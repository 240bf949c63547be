use crate::dtype::DType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::cell::RefCell;
use std::rc::Rc;

/// Type alias for a reference-counted, interior-mutable tensor.
///
/// We use `Rc<RefCell<RawTensor>>` so several modules can hold the same
/// parameter (cross-tower aliasing, precision conversion in place) while still
/// allowing the storage to be overwritten by weight loading.
///
/// **Note**: This is single-threaded only.
pub type Tensor = Rc<RefCell<RawTensor>>;

// ===== RAW TENSOR STRUCTURE =====

/// The core tensor structure
///
/// Fields:
/// - `data`: flat Vec<f32> of values (row-major order)
/// - `shape`: dimensions, e.g. [batch, channels, height, width]
/// - `dtype`: storage precision; values are always representable in it
/// - `requires_grad`: trainable flag, cleared when a tower is locked
#[derive(Clone, PartialEq)]
pub struct RawTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub requires_grad: bool,
}

impl std::fmt::Debug for RawTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

// ===== RANDOMNESS =====

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_os_rng());
}

/// Reseed the thread-local generator used by every initializer.
pub fn manual_seed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// Run `f` with exclusive access to the thread-local generator.
pub fn with_rng<F, T>(f: F) -> T
where
    F: FnOnce(&mut StdRng) -> T,
{
    RNG.with(|rng| f(&mut rng.borrow_mut()))
}

// ===== TENSOR CONSTRUCTORS =====
impl RawTensor {
    /// Create a new f32 tensor from data and shape
    ///
    /// # Panics
    /// Panics if data.len() != shape.product()
    pub fn new(data: Vec<f32>, shape: &[usize], requires_grad: bool) -> Tensor {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Data length must match shape {shape:?}"
        );
        Rc::new(RefCell::new(RawTensor {
            data,
            shape: shape.to_vec(),
            dtype: DType::F32,
            requires_grad,
        }))
    }

    /// Create a tensor tagged with `dtype`, rounding the values into it.
    pub fn from_raw(mut data: Vec<f32>, shape: &[usize], dtype: DType) -> Tensor {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Data length must match shape {shape:?}"
        );
        dtype.round_slice(&mut data);
        Rc::new(RefCell::new(RawTensor {
            data,
            shape: shape.to_vec(),
            dtype,
            requires_grad: false,
        }))
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: &[usize]) -> Tensor {
        Self::full(0.0, shape)
    }

    /// Create a tensor filled with ones
    pub fn ones(shape: &[usize]) -> Tensor {
        Self::full(1.0, shape)
    }

    /// Create a tensor filled with a constant value
    pub fn full(value: f32, shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        Self::new(vec![value; size], shape, false)
    }

    /// Zero-dimensional tensor holding one value
    pub fn scalar(value: f32) -> Tensor {
        Self::new(vec![value], &[], false)
    }

    /// Create a tensor with values from standard normal distribution N(0, 1)
    pub fn randn(shape: &[usize]) -> Tensor {
        Self::randn_scaled(shape, 1.0)
    }

    /// Normal initialization N(0, std^2)
    pub fn randn_scaled(shape: &[usize], std: f32) -> Tensor {
        let size = shape.iter().product();
        let data: Vec<f32> = with_rng(|rng| {
            (0..size)
                .map(|_| rng.sample::<f32, _>(StandardNormal) * std)
                .collect()
        });
        Self::new(data, shape, false)
    }

    /// Uniform initialization in [-limit, limit)
    pub fn uniform(shape: &[usize], limit: f32) -> Tensor {
        let size = shape.iter().product();
        if limit <= 0.0 {
            return Self::zeros(shape);
        }
        let data: Vec<f32> =
            with_rng(|rng| (0..size).map(|_| rng.random_range(-limit..limit)).collect());
        Self::new(data, shape, false)
    }

    /// Xavier uniform initialization for a `[fan_out, fan_in]` weight
    ///
    /// Samples weights uniformly from [-limit, limit] where
    /// limit = sqrt(6 / (fan_in + fan_out))
    pub fn xavier_uniform(shape: &[usize]) -> Tensor {
        let fan_out = shape[0];
        let fan_in: usize = shape[1..].iter().product();
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
        Self::uniform(shape, limit)
    }

    /// Mark a freshly created tensor as a trainable parameter
    pub fn parameter(t: Tensor) -> Tensor {
        t.borrow_mut().requires_grad = true;
        t
    }

    /// Number of elements
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Overwrite the storage precision in place, keeping `requires_grad`.
    pub fn cast_(&mut self, dtype: DType) {
        dtype.round_slice(&mut self.data);
        self.dtype = dtype;
    }
}

// ===== TRAIT-BASED API =====

/// Public trait for tensor operations
///
/// This provides a more ergonomic API: `tensor.add(&other)` instead of `RawTensor::add(&tensor, &other)`
pub trait TensorOps {
    // Metadata
    fn shape(&self) -> Vec<usize>;
    fn dtype(&self) -> DType;
    fn rank(&self) -> usize;
    fn numel(&self) -> usize;
    fn to_vec(&self) -> Vec<f32>;

    // Binary ops
    fn add(&self, other: &Tensor) -> Tensor;
    fn sub(&self, other: &Tensor) -> Tensor;
    fn elem_mul(&self, other: &Tensor) -> Tensor;
    fn div(&self, other: &Tensor) -> Tensor;
    fn add_scalar(&self, value: f32) -> Tensor;
    fn mul_scalar(&self, value: f32) -> Tensor;

    // Unary ops
    fn neg(&self) -> Tensor;
    fn sqrt(&self) -> Tensor;
    fn exp(&self) -> Tensor;
    fn tanh(&self) -> Tensor;
    fn sigmoid(&self) -> Tensor;
    fn relu(&self) -> Tensor;
    fn gelu(&self) -> Tensor;
    fn quick_gelu(&self) -> Tensor;

    // Axis reductions
    fn sum_dim(&self, dim: usize, keepdim: bool) -> Tensor;
    fn mean_dim(&self, dim: usize, keepdim: bool) -> Tensor;
    fn max_dim(&self, dim: usize, keepdim: bool) -> Tensor;
    fn norm_dim(&self, dim: usize, keepdim: bool) -> Tensor;
    fn softmax(&self, dim: usize) -> Tensor;
    fn l2_normalize(&self, dim: usize) -> Tensor;

    // Movement ops
    fn reshape(&self, new_shape: &[usize]) -> Tensor;
    fn permute(&self, axes: &[usize]) -> Tensor;
    fn transpose(&self) -> Tensor;
    fn narrow(&self, dim: usize, start: usize, len: usize) -> Tensor;
    fn select(&self, dim: usize, index: usize) -> Tensor;
    fn unsqueeze(&self, dim: usize) -> Tensor;
    fn expand(&self, new_shape: &[usize]) -> Tensor;

    // Matmul
    fn matmul(&self, other: &Tensor) -> Tensor;
}

impl TensorOps for Tensor {
    fn shape(&self) -> Vec<usize> {
        self.borrow().shape.clone()
    }
    fn dtype(&self) -> DType {
        self.borrow().dtype
    }
    fn rank(&self) -> usize {
        self.borrow().shape.len()
    }
    fn numel(&self) -> usize {
        self.borrow().numel()
    }
    fn to_vec(&self) -> Vec<f32> {
        self.borrow().data.clone()
    }

    fn add(&self, other: &Tensor) -> Tensor {
        RawTensor::add(self, other)
    }
    fn sub(&self, other: &Tensor) -> Tensor {
        RawTensor::sub(self, other)
    }
    fn elem_mul(&self, other: &Tensor) -> Tensor {
        RawTensor::elem_mul(self, other)
    }
    fn div(&self, other: &Tensor) -> Tensor {
        RawTensor::div(self, other)
    }
    fn add_scalar(&self, value: f32) -> Tensor {
        RawTensor::map_scalar(self, |x| x + value)
    }
    fn mul_scalar(&self, value: f32) -> Tensor {
        RawTensor::map_scalar(self, |x| x * value)
    }

    fn neg(&self) -> Tensor {
        RawTensor::neg(self)
    }
    fn sqrt(&self) -> Tensor {
        RawTensor::sqrt(self)
    }
    fn exp(&self) -> Tensor {
        RawTensor::exp(self)
    }
    fn tanh(&self) -> Tensor {
        RawTensor::tanh(self)
    }
    fn sigmoid(&self) -> Tensor {
        RawTensor::sigmoid(self)
    }
    fn relu(&self) -> Tensor {
        RawTensor::relu(self)
    }
    fn gelu(&self) -> Tensor {
        RawTensor::gelu(self)
    }
    fn quick_gelu(&self) -> Tensor {
        RawTensor::quick_gelu(self)
    }

    fn sum_dim(&self, dim: usize, keepdim: bool) -> Tensor {
        RawTensor::sum_dim(self, dim, keepdim)
    }
    fn mean_dim(&self, dim: usize, keepdim: bool) -> Tensor {
        RawTensor::mean_dim(self, dim, keepdim)
    }
    fn max_dim(&self, dim: usize, keepdim: bool) -> Tensor {
        RawTensor::max_dim(self, dim, keepdim)
    }
    fn norm_dim(&self, dim: usize, keepdim: bool) -> Tensor {
        RawTensor::norm_dim(self, dim, keepdim)
    }
    fn softmax(&self, dim: usize) -> Tensor {
        RawTensor::softmax(self, dim)
    }
    fn l2_normalize(&self, dim: usize) -> Tensor {
        RawTensor::l2_normalize(self, dim)
    }

    fn reshape(&self, new_shape: &[usize]) -> Tensor {
        RawTensor::reshape(self, new_shape)
    }
    fn permute(&self, axes: &[usize]) -> Tensor {
        RawTensor::permute(self, axes)
    }
    fn transpose(&self) -> Tensor {
        RawTensor::transpose(self)
    }
    fn narrow(&self, dim: usize, start: usize, len: usize) -> Tensor {
        RawTensor::narrow(self, dim, start, len)
    }
    fn select(&self, dim: usize, index: usize) -> Tensor {
        RawTensor::select(self, dim, index)
    }
    fn unsqueeze(&self, dim: usize) -> Tensor {
        RawTensor::unsqueeze(self, dim)
    }
    fn expand(&self, new_shape: &[usize]) -> Tensor {
        RawTensor::expand(self, new_shape)
    }

    fn matmul(&self, other: &Tensor) -> Tensor {
        RawTensor::matmul(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_randn_is_reproducible() {
        manual_seed(7);
        let a = RawTensor::randn(&[4, 4]).to_vec();
        manual_seed(7);
        let b = RawTensor::randn(&[4, 4]).to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_raw_rounds_into_dtype() {
        let t = RawTensor::from_raw(vec![0.1, 1.0 / 3.0], &[2], DType::F16);
        let data = t.to_vec();
        assert_eq!(t.dtype(), DType::F16);
        assert_eq!(data[0], half::f16::from_f32(0.1).to_f32());
        assert_ne!(data[1], 1.0 / 3.0);
    }

    #[test]
    fn test_cast_in_place_keeps_requires_grad() {
        let t = RawTensor::parameter(RawTensor::ones(&[3]));
        t.borrow_mut().cast_(DType::BF16);
        assert!(t.borrow().requires_grad);
        assert_eq!(t.dtype(), DType::BF16);
    }

    #[test]
    #[should_panic(expected = "Data length must match shape")]
    fn test_shape_mismatch_panics() {
        let _ = RawTensor::new(vec![1.0, 2.0], &[3], false);
    }
}
