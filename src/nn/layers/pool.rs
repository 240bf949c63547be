use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor};

/// Average pooling over `[B, C, H, W]` with a square window and no padding
pub struct AvgPool2d {
    pub kernel: usize,
    pub stride: usize,
}

impl AvgPool2d {
    pub fn new(kernel: usize) -> Self {
        AvgPool2d {
            kernel,
            stride: kernel,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let s = x.borrow();
        assert_eq!(s.shape.len(), 4, "AvgPool2d expected 4D input (B,C,H,W)");
        let (planes, h, w) = (s.shape[0] * s.shape[1], s.shape[2], s.shape[3]);
        let (k, st) = (self.kernel, self.stride);
        let h_out = (h - k) / st + 1;
        let w_out = (w - k) / st + 1;
        let norm = (k * k) as f32;

        let mut out = Vec::with_capacity(planes * h_out * w_out);
        for p in 0..planes {
            let plane = &s.data[p * h * w..(p + 1) * h * w];
            for oy in 0..h_out {
                for ox in 0..w_out {
                    let mut acc = 0.0;
                    for ky in 0..k {
                        let row = (oy * st + ky) * w + ox * st;
                        acc += plane[row..row + k].iter().sum::<f32>();
                    }
                    out.push(acc / norm);
                }
            }
        }
        RawTensor::from_raw(out, &[s.shape[0], s.shape[1], h_out, w_out], s.dtype)
    }
}

impl Module for AvgPool2d {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorOps;

    #[test]
    fn test_avg_pool_2x2() {
        let x = RawTensor::new((0..16).map(|i| i as f32).collect(), &[1, 1, 4, 4], false);
        let y = AvgPool2d::new(2).forward(&x);
        assert_eq!(y.shape(), vec![1, 1, 2, 2]);
        assert_eq!(y.to_vec(), vec![2.5, 4.5, 10.5, 12.5]);
    }
}
