use crate::dtype::DType;
use crate::nn::{LayerKind, Module, TensorKind};
use crate::tensor::{RawTensor, Tensor};

/// Where layer-norm statistics are computed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NormPrecision {
    /// Normalize at the input dtype (intermediates rounded to it)
    #[default]
    Native,
    /// Always normalize in f32, then cast back to the input dtype
    Fp32,
}

/// Layer normalization over the last axis, with affine weight and bias
pub struct LayerNorm {
    pub weight: Tensor,
    pub bias: Tensor,
    pub eps: f32,
    pub precision: NormPrecision,
}

impl LayerNorm {
    pub fn new(dim: usize, precision: NormPrecision) -> Self {
        LayerNorm {
            weight: RawTensor::parameter(RawTensor::ones(&[dim])),
            bias: RawTensor::parameter(RawTensor::zeros(&[dim])),
            eps: 1e-5,
            precision,
        }
    }

    pub fn dim(&self) -> usize {
        self.weight.borrow().shape[0]
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let xs = x.borrow();
        let w = self.weight.borrow();
        let b = self.bias.borrow();
        let dim = w.shape[0];
        assert_eq!(
            xs.shape.last().copied(),
            Some(dim),
            "LayerNorm expects last dim {dim}, got {:?}",
            xs.shape
        );

        let in_dtype = xs.dtype;
        let stat_dtype = match self.precision {
            NormPrecision::Fp32 => DType::F32,
            NormPrecision::Native => in_dtype,
        };

        let mut out = Vec::with_capacity(xs.data.len());
        for row in xs.data.chunks(dim) {
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let inv = 1.0 / (var + self.eps).sqrt();
            for ((&v, &g), &beta) in row.iter().zip(&w.data).zip(&b.data) {
                let normed = stat_dtype.round((v - mean) * inv);
                out.push(normed * g + beta);
            }
        }

        // Output is always cast back to the input dtype
        RawTensor::from_raw(out, &xs.shape, in_dtype)
    }
}

impl Module for LayerNorm {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("weight", &self.weight, TensorKind::Parameter);
        f("bias", &self.bias, TensorKind::Parameter);
    }

    fn layer_kind(&self) -> LayerKind {
        LayerKind::Norm
    }
}
