use crate::dtype::DType;
use crate::nn::{LayerKind, Module, TensorKind};
use crate::tensor::{RawTensor, Tensor};

/// Batch normalization over the channel axis of `[B, C, H, W]` input
pub struct BatchNorm2d {
    num_features: usize,
    eps: f32,
    momentum: f32,
    training: bool,
    frozen: bool,
    // Parameters (Learnable)
    pub weight: Tensor,
    pub bias: Tensor,
    // Buffers (Non-learnable)
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub num_batches_tracked: Tensor,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self::new_with_params(num_features, 1e-5, 0.1)
    }

    pub fn new_with_params(num_features: usize, eps: f32, momentum: f32) -> Self {
        BatchNorm2d {
            num_features,
            eps,
            momentum,
            training: true,
            frozen: false,
            weight: RawTensor::parameter(RawTensor::ones(&[num_features])),
            bias: RawTensor::parameter(RawTensor::zeros(&[num_features])),
            running_mean: RawTensor::zeros(&[num_features]),
            running_var: RawTensor::ones(&[num_features]),
            num_batches_tracked: RawTensor::from_raw(vec![0.0], &[], DType::I64),
        }
    }

    /// Pin the layer to its running statistics and stop its affine
    /// parameters from training. Survives later `train(true)` calls.
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.weight.borrow_mut().requires_grad = false;
        self.bias.borrow_mut().requires_grad = false;
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let xs = x.borrow();
        assert_eq!(xs.shape.len(), 4, "BatchNorm2d expected 4D input (B,C,H,W)");
        assert_eq!(xs.shape[1], self.num_features, "Channel mismatch");
        let (b, c, h, w) = (xs.shape[0], xs.shape[1], xs.shape[2], xs.shape[3]);
        let plane = h * w;
        let count = (b * plane) as f32;

        let (mean, var) = if self.training && !self.frozen {
            let mut mean = vec![0.0; c];
            let mut var = vec![0.0; c];
            for ci in 0..c {
                let lanes = (0..b).flat_map(|bi| {
                    let start = (bi * c + ci) * plane;
                    xs.data[start..start + plane].iter().copied()
                });
                let m = lanes.clone().sum::<f32>() / count;
                mean[ci] = m;
                var[ci] = lanes.map(|v| (v - m) * (v - m)).sum::<f32>() / count;
            }

            // running stats use the unbiased variance
            {
                let mut rm = self.running_mean.borrow_mut();
                let mut rv = self.running_var.borrow_mut();
                let m = self.momentum;
                let correction = if count > 1.0 { count / (count - 1.0) } else { 1.0 };
                for i in 0..c {
                    rm.data[i] = (1.0 - m) * rm.data[i] + m * mean[i];
                    rv.data[i] = (1.0 - m) * rv.data[i] + m * var[i] * correction;
                }
            }
            self.num_batches_tracked.borrow_mut().data[0] += 1.0;
            (mean, var)
        } else {
            (
                self.running_mean.borrow().data.clone(),
                self.running_var.borrow().data.clone(),
            )
        };

        let gamma = self.weight.borrow();
        let beta = self.bias.borrow();
        let mut out = vec![0.0; xs.data.len()];
        for bi in 0..b {
            for ci in 0..c {
                let scale = gamma.data[ci] / (var[ci] + self.eps).sqrt();
                let shift = beta.data[ci] - mean[ci] * scale;
                let start = (bi * c + ci) * plane;
                for (o, &v) in out[start..start + plane]
                    .iter_mut()
                    .zip(&xs.data[start..start + plane])
                {
                    *o = v * scale + shift;
                }
            }
        }
        RawTensor::from_raw(out, &xs.shape, DType::promote(xs.dtype, gamma.dtype))
    }
}

impl Module for BatchNorm2d {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("weight", &self.weight, TensorKind::Parameter);
        f("bias", &self.bias, TensorKind::Parameter);
        f("running_mean", &self.running_mean, TensorKind::Buffer);
        f("running_var", &self.running_var, TensorKind::Buffer);
        f(
            "num_batches_tracked",
            &self.num_batches_tracked,
            TensorKind::Buffer,
        );
    }

    fn layer_kind(&self) -> LayerKind {
        LayerKind::Norm
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }
}
