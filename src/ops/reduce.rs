use crate::{RawTensor, Tensor};

/// Reduction operations along one axis
#[derive(Clone, Copy, Debug)]
pub enum ReduceOp {
    Sum,  // Σ(x)
    Max,  // max(x)
    Mean, // Σ(x) / n
    Norm, // √Σ(x²)
}

/// Split a shape around `dim` into (outer, size, inner) extents
pub(crate) fn split_at_dim(shape: &[usize], dim: usize) -> (usize, usize, usize) {
    assert!(
        dim < shape.len(),
        "Dimension {dim} out of range for shape {shape:?}"
    );
    let outer = shape[..dim].iter().product();
    let inner = shape[dim + 1..].iter().product();
    (outer, shape[dim], inner)
}

fn reduced_shape(shape: &[usize], dim: usize, keepdim: bool) -> Vec<usize> {
    let mut out = shape.to_vec();
    if keepdim {
        out[dim] = 1;
    } else {
        out.remove(dim);
    }
    out
}

impl RawTensor {
    /// Reduce a single axis
    ///
    /// The result keeps the input dtype.
    pub fn reduce_dim(self_t: &Tensor, dim: usize, keepdim: bool, op: ReduceOp) -> Tensor {
        let s = self_t.borrow();
        let (outer, size, inner) = split_at_dim(&s.shape, dim);
        let mut result = Vec::with_capacity(outer * inner);

        for o in 0..outer {
            for i in 0..inner {
                let lane = (0..size).map(|k| s.data[(o * size + k) * inner + i]);
                let v = match op {
                    ReduceOp::Sum => lane.sum::<f32>(),
                    ReduceOp::Mean => lane.sum::<f32>() / size as f32,
                    ReduceOp::Max => lane.fold(f32::NEG_INFINITY, f32::max),
                    ReduceOp::Norm => lane.map(|x| x * x).sum::<f32>().sqrt(),
                };
                result.push(v);
            }
        }

        Self::from_raw(result, &reduced_shape(&s.shape, dim, keepdim), s.dtype)
    }

    pub fn sum_dim(self_t: &Tensor, dim: usize, keepdim: bool) -> Tensor {
        Self::reduce_dim(self_t, dim, keepdim, ReduceOp::Sum)
    }
    pub fn mean_dim(self_t: &Tensor, dim: usize, keepdim: bool) -> Tensor {
        Self::reduce_dim(self_t, dim, keepdim, ReduceOp::Mean)
    }
    pub fn max_dim(self_t: &Tensor, dim: usize, keepdim: bool) -> Tensor {
        Self::reduce_dim(self_t, dim, keepdim, ReduceOp::Max)
    }
    pub fn norm_dim(self_t: &Tensor, dim: usize, keepdim: bool) -> Tensor {
        Self::reduce_dim(self_t, dim, keepdim, ReduceOp::Norm)
    }

    /// Numerically stable softmax along `dim`
    ///
    /// Lanes that are entirely -inf produce zeros instead of NaN.
    pub fn softmax(self_t: &Tensor, dim: usize) -> Tensor {
        let s = self_t.borrow();
        let (outer, size, inner) = split_at_dim(&s.shape, dim);
        let mut result = vec![0.0; s.data.len()];

        for o in 0..outer {
            for i in 0..inner {
                let idx = |k: usize| (o * size + k) * inner + i;
                let max = (0..size)
                    .map(|k| s.data[idx(k)])
                    .fold(f32::NEG_INFINITY, f32::max);
                if max == f32::NEG_INFINITY {
                    continue;
                }
                let mut sum = 0.0;
                for k in 0..size {
                    let e = (s.data[idx(k)] - max).exp();
                    result[idx(k)] = e;
                    sum += e;
                }
                for k in 0..size {
                    result[idx(k)] /= sum;
                }
            }
        }

        Self::from_raw(result, &s.shape, s.dtype)
    }

    /// x / max(‖x‖₂, 1e-12) along `dim`
    pub fn l2_normalize(self_t: &Tensor, dim: usize) -> Tensor {
        const EPS: f32 = 1e-12;
        let s = self_t.borrow();
        let (outer, size, inner) = split_at_dim(&s.shape, dim);
        let mut result = s.data.clone();

        for o in 0..outer {
            for i in 0..inner {
                let idx = |k: usize| (o * size + k) * inner + i;
                let norm = (0..size)
                    .map(|k| s.data[idx(k)] * s.data[idx(k)])
                    .sum::<f32>()
                    .sqrt()
                    .max(EPS);
                for k in 0..size {
                    result[idx(k)] /= norm;
                }
            }
        }

        Self::from_raw(result, &s.shape, s.dtype)
    }

    /// Index of the first maximum along the last axis, one per row
    pub fn argmax_last(self_t: &Tensor) -> Vec<usize> {
        let s = self_t.borrow();
        let n = s.shape.last().copied().unwrap_or(1);
        s.data
            .chunks(n.max(1))
            .map(|row| {
                let mut best = 0;
                for (k, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = k;
                    }
                }
                best
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorOps;

    #[test]
    fn test_sum_and_mean_dims() {
        let t = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], false);
        assert_eq!(t.sum_dim(0, false).to_vec(), vec![5.0, 7.0, 9.0]);
        assert_eq!(t.sum_dim(1, true).shape(), vec![2, 1]);
        assert_eq!(t.mean_dim(1, false).to_vec(), vec![2.0, 5.0]);
        assert_eq!(t.max_dim(0, false).to_vec(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = RawTensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 10.0], &[2, 3], false);
        let s = t.softmax(1);
        for row in s.to_vec().chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_fully_masked_lane_is_zero() {
        let t = RawTensor::new(vec![f32::NEG_INFINITY; 3], &[1, 3], false);
        assert_eq!(t.softmax(1).to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let t = RawTensor::new(vec![3.0, 4.0, 0.0, 0.0], &[2, 2], false);
        let n = t.l2_normalize(1).to_vec();
        assert!((n[0] - 0.6).abs() < 1e-6);
        assert!((n[1] - 0.8).abs() < 1e-6);
        assert_eq!(&n[2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_argmax_prefers_first_maximum() {
        let t = RawTensor::new(vec![1.0, 7.0, 7.0, 2.0, 9.0, 0.0, 0.0, 0.0], &[2, 4], false);
        assert_eq!(RawTensor::argmax_last(&t), vec![1, 0]);
    }
}
