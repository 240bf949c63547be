use crate::dtype::DType;
use crate::{RawTensor, Tensor};

/// Binary operations: two inputs, one output
///
/// Broadcasting is automatically handled for compatible shapes.
#[derive(Clone, Copy, Debug)]
pub enum BinaryOp {
    Add, // x + y
    Sub, // x - y
    Mul, // x * y (element-wise)
    Div, // x / y (element-wise)
}

impl BinaryOp {
    #[inline]
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

impl RawTensor {
    /// Compute the broadcast shape of two tensors
    ///
    /// Shapes are aligned from the right; each pair of dimensions must be
    /// equal or one of them must be 1.
    /// # Panics
    /// Incompatible shapes
    pub fn broadcast_shape(shape_a: &[usize], shape_b: &[usize]) -> Vec<usize> {
        let max_len = shape_a.len().max(shape_b.len());
        let mut result = vec![1; max_len];

        // Align from right (trailing dimensions)
        for i in 0..max_len {
            let a_dim = if i < shape_a.len() {
                shape_a[shape_a.len() - 1 - i]
            } else {
                1
            };
            let b_dim = if i < shape_b.len() {
                shape_b[shape_b.len() - 1 - i]
            } else {
                1
            };

            result[max_len - 1 - i] = if a_dim == b_dim || b_dim == 1 {
                a_dim
            } else if a_dim == 1 {
                b_dim
            } else {
                panic!("Cannot broadcast shapes {shape_a:?} and {shape_b:?} at dimension {i}");
            };
        }
        result
    }

    /// Broadcast data from one shape to another
    ///
    /// This repeats values along dimensions where `from_shape` is 1
    /// and `to_shape` is larger.
    pub(crate) fn broadcast_to(data: &[f32], from_shape: &[usize], to_shape: &[usize]) -> Vec<f32> {
        if from_shape == to_shape {
            return data.to_vec();
        }

        let to_size: usize = to_shape.iter().product();
        let mut result = vec![0.0; to_size];

        // Pad from_shape with leading 1s to match rank
        let mut padded_from = vec![1; to_shape.len()];
        let offset = to_shape.len() - from_shape.len();
        padded_from[offset..].copy_from_slice(from_shape);
        let from_strides = Self::compute_strides(&padded_from);
        let to_strides = Self::compute_strides(to_shape);

        // For each output position, compute corresponding input position
        for (i, slot) in result.iter_mut().enumerate() {
            let mut from_idx = 0;
            let mut remainder = i;
            for dim in 0..to_shape.len() {
                let coord = remainder / to_strides[dim];
                remainder %= to_strides[dim];
                // broadcast dims (size 1) always read coordinate 0
                if padded_from[dim] != 1 {
                    from_idx += coord * from_strides[dim];
                }
            }
            *slot = data[from_idx];
        }
        result
    }

    /// Apply a binary operation with broadcasting
    ///
    /// Steps:
    /// 1. Compute broadcast shape
    /// 2. Broadcast both inputs to that shape
    /// 3. Apply operation element-wise
    /// 4. Round into the promoted dtype
    /// # Panics
    /// broadcast failure
    pub fn binary_op(self_t: &Tensor, other: &Tensor, op: BinaryOp) -> Tensor {
        let a = self_t.borrow();
        let b = other.borrow();
        let dtype = DType::promote(a.dtype, b.dtype);

        if a.shape == b.shape {
            let data = a
                .data
                .iter()
                .zip(&b.data)
                .map(|(&x, &y)| op.apply(x, y))
                .collect();
            return Self::from_raw(data, &a.shape, dtype);
        }

        let out_shape = Self::broadcast_shape(&a.shape, &b.shape);
        let bc_a = Self::broadcast_to(&a.data, &a.shape, &out_shape);
        let bc_b = Self::broadcast_to(&b.data, &b.shape, &out_shape);
        let data = bc_a
            .iter()
            .zip(&bc_b)
            .map(|(&x, &y)| op.apply(x, y))
            .collect();
        Self::from_raw(data, &out_shape, dtype)
    }

    /// Apply `f` to every element, keeping shape and dtype
    pub fn map_scalar<F>(self_t: &Tensor, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        let s = self_t.borrow();
        let data = s.data.iter().map(|&x| f(x)).collect();
        Self::from_raw(data, &s.shape, s.dtype)
    }

    // Convenience methods for binary operations
    pub fn add(self_t: &Tensor, other: &Tensor) -> Tensor {
        Self::binary_op(self_t, other, BinaryOp::Add)
    }
    pub fn sub(self_t: &Tensor, other: &Tensor) -> Tensor {
        Self::binary_op(self_t, other, BinaryOp::Sub)
    }
    pub fn elem_mul(self_t: &Tensor, other: &Tensor) -> Tensor {
        Self::binary_op(self_t, other, BinaryOp::Mul)
    }
    pub fn div(self_t: &Tensor, other: &Tensor) -> Tensor {
        Self::binary_op(self_t, other, BinaryOp::Div)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorOps;

    #[test]
    fn test_broadcast_row_vector() {
        let a = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], false);
        let b = RawTensor::new(vec![10.0, 20.0, 30.0], &[3], false);
        let c = a.add(&b);
        assert_eq!(c.shape(), vec![2, 3]);
        assert_eq!(c.to_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_broadcast_column() {
        let a = RawTensor::new(vec![1.0, 2.0], &[2, 1], false);
        let b = RawTensor::new(vec![1.0, 2.0, 3.0], &[1, 3], false);
        let c = a.elem_mul(&b);
        assert_eq!(c.shape(), vec![2, 3]);
        assert_eq!(c.to_vec(), vec![1.0, 2.0, 3.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_result_dtype_is_promoted() {
        let a = RawTensor::from_raw(vec![1.0, 2.0], &[2], DType::F16);
        let b = RawTensor::from_raw(vec![0.1, 0.1], &[2], DType::F16);
        let c = a.add(&b);
        assert_eq!(c.dtype(), DType::F16);
        assert_eq!(c.to_vec()[0], DType::F16.round(1.0 + DType::F16.round(0.1)));

        let f = RawTensor::new(vec![1.0, 1.0], &[2], false);
        assert_eq!(a.add(&f).dtype(), DType::F32);
    }

    #[test]
    #[should_panic(expected = "Cannot broadcast")]
    fn test_incompatible_shapes_panic() {
        let a = RawTensor::zeros(&[2, 3]);
        let b = RawTensor::zeros(&[4]);
        let _ = a.add(&b);
    }
}
