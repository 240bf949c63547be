use crate::dtype::DType;
use crate::nn::{LayerKind, Module, TensorKind};
use crate::tensor::{RawTensor, Tensor};

/// Fully-connected (dense/linear) layer
///
/// Computes: y = xWᵀ + b
/// where x is (..., in_features), W is (out_features, in_features), b is (out_features)
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Create a new linear layer with random initialization
    ///
    /// Weights and bias are drawn from U(-1/√in, 1/√in).
    pub fn new(in_features: usize, out_features: usize, use_bias: bool) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = RawTensor::parameter(RawTensor::uniform(&[out_features, in_features], bound));
        let bias = use_bias
            .then(|| RawTensor::parameter(RawTensor::uniform(&[out_features], bound)));
        Linear { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.borrow().shape[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.borrow().shape[0]
    }

    /// Forward pass through the layer
    ///
    /// # Panics
    /// Last input axis differs from `in_features`
    pub fn forward(&self, x: &Tensor) -> Tensor {
        linear(x, &self.weight, self.bias.as_ref())
    }
}

/// y = xWᵀ + b without materializing the transpose
pub fn linear(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Tensor {
    let xs = x.borrow();
    let w = weight.borrow();
    let (out_f, in_f) = (w.shape[0], w.shape[1]);
    let last = xs.shape.last().copied().unwrap_or(0);
    assert_eq!(
        last, in_f,
        "Linear expects last dim {in_f}, got shape {:?}",
        xs.shape
    );

    let rows = xs.data.len() / in_f.max(1);
    let mut out = vec![0.0; rows * out_f];
    for r in 0..rows {
        let xr = &xs.data[r * in_f..(r + 1) * in_f];
        for o in 0..out_f {
            let wr = &w.data[o * in_f..(o + 1) * in_f];
            out[r * out_f + o] = xr.iter().zip(wr).map(|(a, b)| a * b).sum();
        }
    }

    let mut dtype = DType::promote(xs.dtype, w.dtype);
    if let Some(b) = bias {
        let b = b.borrow();
        dtype = DType::promote(dtype, b.dtype);
        for row in out.chunks_mut(out_f) {
            for (o, bv) in row.iter_mut().zip(&b.data) {
                *o += bv;
            }
        }
    }

    let mut shape = xs.shape.clone();
    if let Some(l) = shape.last_mut() {
        *l = out_f;
    }
    RawTensor::from_raw(out, &shape, dtype)
}

impl Module for Linear {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("weight", &self.weight, TensorKind::Parameter);
        if let Some(b) = &self.bias {
            f("bias", b, TensorKind::Parameter);
        }
    }

    fn layer_kind(&self) -> LayerKind {
        LayerKind::Linear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorOps;

    #[test]
    fn test_linear_matches_manual() {
        let layer = Linear::new(2, 2, true);
        layer.weight.borrow_mut().data = vec![1.0, 2.0, 3.0, 4.0];
        layer.bias.as_ref().unwrap().borrow_mut().data = vec![0.5, -0.5];
        let x = RawTensor::new(vec![1.0, 1.0, 2.0, 0.0], &[2, 2], false);
        let y = layer.forward(&x);
        assert_eq!(y.to_vec(), vec![3.5, 6.5, 2.5, 5.5]);
    }

    #[test]
    fn test_linear_keeps_leading_axes() {
        let layer = Linear::new(4, 3, false);
        let y = layer.forward(&RawTensor::randn(&[2, 5, 4]));
        assert_eq!(y.shape(), vec![2, 5, 3]);
        assert_eq!(layer.state_dict().len(), 1);
    }
}
