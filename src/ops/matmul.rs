use crate::dtype::DType;
use crate::{RawTensor, Tensor};

// ===== MATRIX MULTIPLICATION =====

impl RawTensor {
    /// Raw matrix multiplication: (m,k) @ (k,n) -> (m,n)
    /// Uses the naive O(mnk) algorithm with an i-p-j loop order.
    pub fn matmul_raw(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut result = vec![0.0; m * n];
        for i in 0..m {
            let out_row = &mut result[i * n..(i + 1) * n];
            for p in 0..k {
                let a_ip = a[i * k + p];
                if a_ip == 0.0 {
                    continue;
                }
                let b_row = &b[p * n..(p + 1) * n];
                for (o, &bv) in out_row.iter_mut().zip(b_row) {
                    *o += a_ip * bv;
                }
            }
        }
        result
    }

    /// Matrix multiplication over the last two axes
    ///
    /// Supports:
    /// - (m,k) @ (k,n) -> (m,n)
    /// - (..., m,k) @ (..., k,n) -> (..., m,n) with broadcast batch axes
    /// - (..., m,k) @ (k,n) -> (..., m,n)
    ///
    /// # Panics
    /// Inner dimension mismatch or rank < 2
    pub fn matmul(self_t: &Tensor, other: &Tensor) -> Tensor {
        let a = self_t.borrow();
        let b = other.borrow();
        assert!(
            a.shape.len() >= 2 && b.shape.len() >= 2,
            "Matmul not supported for shapes: {:?} @ {:?}",
            a.shape,
            b.shape
        );
        let dtype = DType::promote(a.dtype, b.dtype);

        let (m, k) = (a.shape[a.shape.len() - 2], a.shape[a.shape.len() - 1]);
        let (k2, n) = (b.shape[b.shape.len() - 2], b.shape[b.shape.len() - 1]);
        assert_eq!(
            k, k2,
            "Matmul dimension mismatch: {:?} @ {:?}",
            a.shape, b.shape
        );

        let batch_a = &a.shape[..a.shape.len() - 2];
        let batch_b = &b.shape[..b.shape.len() - 2];
        let batch = Self::broadcast_shape(batch_a, batch_b);
        let batch_count: usize = batch.iter().product();

        // Broadcast each operand over the batch axes, matrices stay intact.
        let mut full_a = batch.clone();
        full_a.extend([m, k]);
        let mut full_b = batch.clone();
        full_b.extend([k, n]);
        let data_a = Self::broadcast_to(&a.data, &a.shape, &full_a);
        let data_b = if batch_b.is_empty() {
            b.data.clone()
        } else {
            Self::broadcast_to(&b.data, &b.shape, &full_b)
        };
        let b_step = if batch_b.is_empty() { 0 } else { k * n };

        let mut result = Vec::with_capacity(batch_count * m * n);
        for i in 0..batch_count {
            let lhs = &data_a[i * m * k..(i + 1) * m * k];
            let rhs = &data_b[i * b_step..i * b_step + k * n];
            result.extend(Self::matmul_raw(lhs, rhs, m, k, n));
        }

        let mut out_shape = batch;
        out_shape.extend([m, n]);
        Self::from_raw(result, &out_shape, dtype)
    }

    /// Swap the last two axes
    pub fn transpose(self_t: &Tensor) -> Tensor {
        let rank = self_t.borrow().shape.len();
        assert!(rank >= 2, "Transpose expects at least 2D tensor");
        let mut axes: Vec<usize> = (0..rank).collect();
        axes.swap(rank - 2, rank - 1);
        Self::permute(self_t, &axes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorOps;

    #[test]
    fn test_matmul_2d() {
        let a = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], false);
        let b = RawTensor::new(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2], false);
        let c = a.matmul(&b);
        assert_eq!(c.shape(), vec![2, 2]);
        assert_eq!(c.to_vec(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_batched_matmul_broadcasts_rhs() {
        let a = RawTensor::new(vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0], &[2, 2, 2], false);
        let b = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], false);
        let c = a.matmul(&b);
        assert_eq!(c.shape(), vec![2, 2, 2]);
        assert_eq!(c.to_vec(), vec![1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_batched_matmul_broadcasts_batch_axes() {
        let a = RawTensor::ones(&[2, 1, 3, 4]);
        let b = RawTensor::ones(&[1, 5, 4, 2]);
        let c = a.matmul(&b);
        assert_eq!(c.shape(), vec![2, 5, 3, 2]);
        assert!(c.to_vec().iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_transpose_last_two() {
        let a = RawTensor::new((0..6).map(|i| i as f32).collect(), &[1, 2, 3], false);
        let t = a.transpose();
        assert_eq!(t.shape(), vec![1, 3, 2]);
        assert_eq!(t.to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    #[should_panic(expected = "Matmul dimension mismatch")]
    fn test_inner_dim_mismatch_panics() {
        let _ = RawTensor::ones(&[2, 3]).matmul(&RawTensor::ones(&[2, 3]));
    }
}
