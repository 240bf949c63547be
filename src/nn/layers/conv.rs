use crate::nn::{LayerKind, Module, TensorKind};
use crate::tensor::{RawTensor, Tensor, TensorOps};

pub struct Conv2d {
    pub weight: Tensor,       // [out_channels, in_channels, kernel, kernel]
    pub bias: Option<Tensor>, // [out_channels]
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    pub fn new(
        in_ch: usize,
        out_ch: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        use_bias: bool,
    ) -> Self {
        let bound = 1.0 / ((in_ch * kernel * kernel) as f32).sqrt();
        let weight =
            RawTensor::parameter(RawTensor::uniform(&[out_ch, in_ch, kernel, kernel], bound));
        let bias = use_bias.then(|| RawTensor::parameter(RawTensor::uniform(&[out_ch], bound)));
        Conv2d {
            weight,
            bias,
            stride,
            padding,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.borrow().shape[0]
    }

    fn kernel(&self) -> usize {
        self.weight.borrow().shape[2]
    }

    // Im2col: Convert (B, C, H, W) → (B, C*K*K, H_out*W_out)
    fn im2col(&self, x: &Tensor) -> (Tensor, usize, usize) {
        let s = x.borrow();
        let (b, c, h, w) = (s.shape[0], s.shape[1], s.shape[2], s.shape[3]);
        let (k, st, p) = (self.kernel(), self.stride, self.padding);
        let h_out = (h + 2 * p - k) / st + 1;
        let w_out = (w + 2 * p - k) / st + 1;
        let rows = c * k * k;
        let cols = h_out * w_out;

        let mut out = vec![0.0; b * rows * cols];
        for bi in 0..b {
            for ci in 0..c {
                let plane = &s.data[(bi * c + ci) * h * w..(bi * c + ci + 1) * h * w];
                for ky in 0..k {
                    for kx in 0..k {
                        let row = (ci * k + ky) * k + kx;
                        let dst = &mut out[(bi * rows + row) * cols..(bi * rows + row + 1) * cols];
                        for oy in 0..h_out {
                            let iy = (oy * st + ky) as isize - p as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for ox in 0..w_out {
                                let ix = (ox * st + kx) as isize - p as isize;
                                if ix >= 0 && ix < w as isize {
                                    dst[oy * w_out + ox] = plane[iy as usize * w + ix as usize];
                                }
                            }
                        }
                    }
                }
            }
        }
        (
            RawTensor::from_raw(out, &[b, rows, cols], s.dtype),
            h_out,
            w_out,
        )
    }

    /// 1. im2col: (B, C, H, W) → (B, C*K*K, H_out*W_out)
    /// 2. weight (O, C, K, K) → (O, C*K*K)
    /// 3. matmul → (B, O, H_out*W_out), add bias, reshape
    pub fn forward(&self, x: &Tensor) -> Tensor {
        assert_eq!(x.rank(), 4, "Conv2d expected 4D input (B,C,H,W)");
        let batch = x.shape()[0];
        let out_ch = self.out_channels();
        let (cols, h_out, w_out) = self.im2col(x);
        let w = self.weight.reshape(&[out_ch, cols.shape()[1]]);
        let mut y = w.matmul(&cols);
        if let Some(b) = &self.bias {
            y = y.add(&b.reshape(&[out_ch, 1]));
        }
        y.reshape(&[batch, out_ch, h_out, w_out])
    }
}

impl Module for Conv2d {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("weight", &self.weight, TensorKind::Parameter);
        if let Some(b) = &self.bias {
            f("bias", b, TensorKind::Parameter);
        }
    }

    fn layer_kind(&self) -> LayerKind {
        LayerKind::Conv
    }
}

#[cfg(test)]
mod conv2d_tests {
    use super::*;

    #[test]
    fn test_conv2d_forward_shape() {
        // Input: (1, 3, 32, 32), Conv: 16 filters, 3x3, stride=1, pad=1
        let conv = Conv2d::new(3, 16, 3, 1, 1, true);
        let y = conv.forward(&RawTensor::randn(&[1, 3, 32, 32]));
        assert_eq!(y.shape(), vec![1, 16, 32, 32]);
    }

    #[test]
    fn test_patchify_conv_is_blockwise_sum() {
        // kernel == stride: each output is the sum over one non-overlapping patch
        let conv = Conv2d::new(1, 1, 2, 2, 0, false);
        conv.weight.borrow_mut().data = vec![1.0; 4];
        let x = RawTensor::new((0..16).map(|i| i as f32).collect(), &[1, 1, 4, 4], false);
        let y = conv.forward(&x);
        assert_eq!(y.shape(), vec![1, 1, 2, 2]);
        assert_eq!(y.to_vec(), vec![10.0, 18.0, 42.0, 50.0]);
    }

    #[test]
    fn test_padding_zero_fills_border() {
        let conv = Conv2d::new(1, 1, 3, 1, 1, false);
        conv.weight.borrow_mut().data = vec![1.0; 9];
        let y = conv.forward(&RawTensor::ones(&[1, 1, 3, 3]));
        assert_eq!(y.to_vec(), vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }
}
