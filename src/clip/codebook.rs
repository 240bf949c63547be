//! Shared discrete codebook queried by each modality (FDT).

use crate::nn::{LayerNorm, Linear, Module, NormPrecision};
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// Projects tower tokens into codebook space and pools them into one
/// code-weighted embedding per sample
pub struct FdtQueryModel {
    pub norm: LayerNorm,
    pub proj: Linear,
}

impl FdtQueryModel {
    pub fn new(width: usize, dim: usize, norm: NormPrecision) -> Self {
        FdtQueryModel {
            norm: LayerNorm::new(width, norm),
            proj: Linear::new(width, dim, true),
        }
    }

    /// Code weights `[B, C]`: per-token softmax over codes, max-pooled over
    /// the valid tokens and renormalized to sum to one.
    ///
    /// With `eos`, only tokens up to and including `eos[b]` count.
    pub fn code_weights(&self, x: &Tensor, codebook: &Tensor, eos: Option<&[usize]>) -> Tensor {
        let dim = codebook.shape()[1];
        let q = self.proj.forward(&self.norm.forward(x));
        let probs = q
            .matmul(&codebook.transpose())
            .mul_scalar(1.0 / (dim as f32).sqrt())
            .softmax(2);

        let pooled = match eos {
            None => probs.max_dim(1, false),
            Some(eos) => {
                let shape = probs.shape();
                let (n, c) = (shape[1], shape[2]);
                let data = probs.to_vec();
                let mut out = Vec::with_capacity(eos.len() * c);
                for (b, &end) in eos.iter().enumerate() {
                    let base = b * n * c;
                    let valid = end.min(n - 1) + 1;
                    out.extend((0..c).map(|k| {
                        (0..valid)
                            .map(|t| data[base + t * c + k])
                            .fold(f32::NEG_INFINITY, f32::max)
                    }));
                }
                RawTensor::from_raw(out, &[eos.len(), c], probs.dtype())
            }
        };
        let total = pooled.sum_dim(1, true);
        pooled.div(&total)
    }

    /// `x [B, N, width]`, `codebook [C, dim]` → `[B, dim]`
    pub fn forward(&self, x: &Tensor, codebook: &Tensor, eos: Option<&[usize]>) -> Tensor {
        self.code_weights(x, codebook, eos).matmul(codebook)
    }
}

impl Module for FdtQueryModel {
    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("norm", &self.norm);
        f("proj", &self.proj);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("norm", &mut self.norm);
        f("proj", &mut self.proj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_are_a_distribution() {
        let model = FdtQueryModel::new(6, 4, NormPrecision::Native);
        let codebook = RawTensor::randn(&[10, 4]);
        let x = RawTensor::randn(&[2, 5, 6]);
        let w = model.code_weights(&x, &codebook, None);
        assert_eq!(w.shape(), vec![2, 10]);
        for row in w.to_vec().chunks(10) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&v| v >= 0.0));
        }
        assert_eq!(model.forward(&x, &codebook, None).shape(), vec![2, 4]);
    }

    #[test]
    fn test_tokens_after_eos_are_ignored() {
        let model = FdtQueryModel::new(6, 4, NormPrecision::Native);
        let codebook = RawTensor::randn(&[8, 4]);
        let x = RawTensor::randn(&[1, 5, 6]);
        let a = model.forward(&x, &codebook, Some(&[1])).to_vec();

        let mut data = x.to_vec();
        for v in &mut data[2 * 6..] {
            *v += 3.0;
        }
        let y = RawTensor::new(data, &[1, 5, 6], false);
        let b = model.forward(&y, &codebook, Some(&[1])).to_vec();
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-6);
        }
    }
}
