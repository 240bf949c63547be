use crate::ops::reduce::split_at_dim;
use crate::{RawTensor, Tensor};

// ===== MOVEMENT OPERATIONS =====
impl RawTensor {
    /// Reshape tensor to new shape (same number of elements)
    pub fn reshape(self_t: &Tensor, new_shape: &[usize]) -> Tensor {
        let s = self_t.borrow();
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            s.numel(),
            new_size,
            "Cannot reshape {:?} to {new_shape:?}: size mismatch",
            s.shape
        );
        Self::from_raw(s.data.clone(), new_shape, s.dtype)
    }

    /// Permute (reorder) tensor axes
    ///
    /// # Arguments
    /// * `axes` - New ordering of axes (must be a valid permutation of 0..rank)
    pub fn permute(self_t: &Tensor, axes: &[usize]) -> Tensor {
        let s = self_t.borrow();
        assert_eq!(axes.len(), s.shape.len(), "Axes length must match rank");
        let mut sorted_axes = axes.to_vec();
        sorted_axes.sort_unstable();
        for (i, &ax) in sorted_axes.iter().enumerate() {
            assert_eq!(i, ax, "Invalid permutation axes {axes:?}");
        }

        let new_shape: Vec<usize> = axes.iter().map(|&i| s.shape[i]).collect();
        let old_strides = Self::compute_strides(&s.shape);
        // stride in the source buffer for each output axis
        let gather: Vec<usize> = axes.iter().map(|&ax| old_strides[ax]).collect();
        let mut new_data = vec![0.0; s.data.len()];
        let mut coords = vec![0usize; new_shape.len()];

        for val in &mut new_data {
            let old_idx: usize = coords.iter().zip(&gather).map(|(c, g)| c * g).sum();
            *val = s.data[old_idx];
            // odometer increment over the new shape
            for d in (0..coords.len()).rev() {
                coords[d] += 1;
                if coords[d] < new_shape[d] {
                    break;
                }
                coords[d] = 0;
            }
        }
        Self::from_raw(new_data, &new_shape, s.dtype)
    }

    /// Expand (broadcast) tensor to larger shape
    ///
    /// Dimensions can only be expanded from size 1 to size N.
    /// Rank must remain the same.
    pub fn expand(self_t: &Tensor, new_shape: &[usize]) -> Tensor {
        let s = self_t.borrow();
        assert_eq!(s.shape.len(), new_shape.len(), "Expand: rank must match");
        for (old_d, new_d) in s.shape.iter().zip(new_shape) {
            assert!(
                *old_d == 1 || old_d == new_d,
                "Cannot expand dimension {old_d} to {new_d}"
            );
        }
        let data = Self::broadcast_to(&s.data, &s.shape, new_shape);
        Self::from_raw(data, new_shape, s.dtype)
    }

    /// Slice `len` entries starting at `start` along `dim`
    pub fn narrow(self_t: &Tensor, dim: usize, start: usize, len: usize) -> Tensor {
        let s = self_t.borrow();
        let (outer, size, inner) = split_at_dim(&s.shape, dim);
        assert!(
            start + len <= size,
            "narrow {start}..{} out of range for dimension {dim} of size {size}",
            start + len
        );
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * size + start) * inner;
            data.extend_from_slice(&s.data[base..base + len * inner]);
        }
        let mut shape = s.shape.clone();
        shape[dim] = len;
        Self::from_raw(data, &shape, s.dtype)
    }

    /// Pick one index along `dim`, removing that axis
    pub fn select(self_t: &Tensor, dim: usize, index: usize) -> Tensor {
        let out = Self::narrow(self_t, dim, index, 1);
        let mut shape = out.borrow().shape.clone();
        shape.remove(dim);
        out.borrow_mut().shape = shape;
        out
    }

    /// Insert a size-1 axis at `dim`
    pub fn unsqueeze(self_t: &Tensor, dim: usize) -> Tensor {
        let mut shape = self_t.borrow().shape.clone();
        assert!(dim <= shape.len(), "unsqueeze dimension {dim} out of range");
        shape.insert(dim, 1);
        Self::reshape(self_t, &shape)
    }

    /// Concatenate tensors along `dim`
    ///
    /// All inputs must agree on every other axis; the result takes the
    /// promoted dtype of the inputs.
    pub fn cat(tensors: &[Tensor], dim: usize) -> Tensor {
        assert!(!tensors.is_empty(), "cat needs at least one tensor");
        let first_shape = tensors[0].borrow().shape.clone();
        let mut dtype = tensors[0].borrow().dtype;
        let mut total = 0;
        for t in tensors {
            let b = t.borrow();
            assert_eq!(b.shape.len(), first_shape.len(), "cat: rank mismatch");
            for (d, (&x, &y)) in b.shape.iter().zip(&first_shape).enumerate() {
                assert!(d == dim || x == y, "cat: shape mismatch {:?} vs {first_shape:?}", b.shape);
            }
            total += b.shape[dim];
            dtype = crate::DType::promote(dtype, b.dtype);
        }

        let (outer, _, inner) = split_at_dim(&first_shape, dim);
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for t in tensors {
                let b = t.borrow();
                let chunk = b.shape[dim] * inner;
                data.extend_from_slice(&b.data[o * chunk..(o + 1) * chunk]);
            }
        }
        let mut shape = first_shape;
        shape[dim] = total;
        Self::from_raw(data, &shape, dtype)
    }

    /// Compute memory strides for row-major layout
    ///
    /// For shape [3, 4, 5], strides are [20, 5, 1]
    /// This tells us how many elements to skip to move one step in each dimension.
    pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }
}

/// Concatenate tensors along `dim`
pub fn cat(tensors: &[Tensor], dim: usize) -> Tensor {
    RawTensor::cat(tensors, dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorOps;

    fn arange(n: usize, shape: &[usize]) -> Tensor {
        RawTensor::new((0..n).map(|i| i as f32).collect(), shape, false)
    }

    #[test]
    fn test_permute_3d() {
        let t = arange(24, &[2, 3, 4]);
        let p = t.permute(&[2, 0, 1]);
        assert_eq!(p.shape(), vec![4, 2, 3]);
        // p[1, 1, 2] == t[1, 2, 1]
        assert_eq!(p.to_vec()[6 + 3 + 2], (12 + 8 + 1) as f32);
    }

    #[test]
    fn test_narrow_and_select() {
        let t = arange(12, &[3, 4]);
        assert_eq!(t.narrow(1, 1, 2).to_vec(), vec![1.0, 2.0, 5.0, 6.0, 9.0, 10.0]);
        let row = t.select(0, 2);
        assert_eq!(row.shape(), vec![4]);
        assert_eq!(row.to_vec(), vec![8.0, 9.0, 10.0, 11.0]);
        assert_eq!(t.select(1, 0).to_vec(), vec![0.0, 4.0, 8.0]);
    }

    #[test]
    fn test_cat_middle_axis() {
        let a = arange(4, &[2, 1, 2]);
        let b = RawTensor::full(9.0, &[2, 2, 2]);
        let c = cat(&[a, b], 1);
        assert_eq!(c.shape(), vec![2, 3, 2]);
        assert_eq!(
            c.to_vec(),
            vec![0.0, 1.0, 9.0, 9.0, 9.0, 9.0, 2.0, 3.0, 9.0, 9.0, 9.0, 9.0]
        );
    }

    #[test]
    fn test_expand_and_unsqueeze() {
        let t = arange(3, &[3]).unsqueeze(0);
        assert_eq!(t.shape(), vec![1, 3]);
        let e = t.expand(&[2, 3]);
        assert_eq!(e.to_vec(), vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
    }
}
