use crate::nn::{Module, TensorKind};
use crate::tensor::{RawTensor, Tensor};

/// Embedding: Maps integer indices to dense vectors
///
/// # Shape
/// - Input: tensor of token ids `[...]` (values are integral)
/// - Output: `[..., embedding_dim]`
pub struct Embedding {
    pub weight: Tensor,
    vocab_size: usize,
    dim: usize,
}

impl Embedding {
    /// Creates a new Embedding layer with N(0, 1) weights
    #[must_use]
    pub fn new(vocab_size: usize, embedding_dim: usize) -> Self {
        assert!(vocab_size > 0, "vocab_size must be positive");
        assert!(embedding_dim > 0, "embedding_dim must be positive");
        Embedding {
            weight: RawTensor::parameter(RawTensor::randn(&[vocab_size, embedding_dim])),
            vocab_size,
            dim: embedding_dim,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Forward pass: lookup embeddings for given token ids
    ///
    /// # Panics
    /// Panics if any index is negative or >= `vocab_size`
    #[must_use]
    pub fn forward(&self, ids: &Tensor) -> Tensor {
        let ids = ids.borrow();
        let w = self.weight.borrow();
        let mut out = Vec::with_capacity(ids.data.len() * self.dim);

        // Gather operation: select rows from weight matrix
        for &id in &ids.data {
            assert!(
                id >= 0.0 && (id as usize) < self.vocab_size,
                "Index {id} out of bounds for vocab_size {}",
                self.vocab_size
            );
            let row = id as usize;
            out.extend_from_slice(&w.data[row * self.dim..(row + 1) * self.dim]);
        }

        let mut shape = ids.shape.clone();
        shape.push(self.dim);
        RawTensor::from_raw(out, &shape, w.dtype)
    }
}

impl Module for Embedding {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("weight", &self.weight, TensorKind::Parameter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorOps;

    #[test]
    fn test_embedding_gathers_rows() {
        let emb = Embedding::new(4, 2);
        emb.weight.borrow_mut().data = vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        let ids = RawTensor::new(vec![3.0, 1.0, 0.0, 2.0], &[2, 2], false);
        let out = emb.forward(&ids);
        assert_eq!(out.shape(), vec![2, 2, 2]);
        assert_eq!(out.to_vec(), vec![3.0, 3.0, 1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_embedding_out_of_bounds() {
        let emb = Embedding::new(4, 2);
        let _ = emb.forward(&RawTensor::new(vec![4.0], &[1], false));
    }
}
