use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor, TensorOps, with_rng};
use rand::Rng;

fn check_prob(p: f32) {
    assert!(
        (0.0..=1.0).contains(&p),
        "Dropout probability must be in [0, 1]"
    );
}

/// Element-wise dropout with inverted scaling
pub struct Dropout {
    p: f32,
    training: bool,
}

impl Dropout {
    /// Create a new Dropout layer
    ///
    /// # Arguments
    /// * `p` - Probability of an element being zeroed out
    /// # Panics
    /// dropout prob must be in \[0,1\]
    #[must_use]
    pub fn new(p: f32) -> Self {
        check_prob(p);
        Self { p, training: true }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        if !self.training || self.p == 0.0 {
            return x.clone();
        }

        let keep_prob = 1.0 - self.p;
        let scale = if keep_prob > 0.0 { 1.0 / keep_prob } else { 0.0 };
        let shape = x.shape();
        let size: usize = shape.iter().product();

        // Generate mask: scale with prob (1-p), 0 with prob p
        let mask_data: Vec<f32> = with_rng(|rng| {
            (0..size)
                .map(|_| {
                    if rng.random::<f32>() < keep_prob {
                        scale
                    } else {
                        0.0
                    }
                })
                .collect()
        });
        x.elem_mul(&RawTensor::new(mask_data, &shape, false))
    }
}

impl Module for Dropout {
    fn train(&mut self, mode: bool) {
        self.training = mode;
    }
}

/// Stochastic depth: drops a whole residual branch per sample
pub struct DropPath {
    p: f32,
    training: bool,
}

impl DropPath {
    #[must_use]
    pub fn new(p: f32) -> Self {
        check_prob(p);
        Self { p, training: true }
    }

    /// `x` is `[B, ...]`; each sample is kept with probability 1-p
    pub fn forward(&self, x: &Tensor) -> Tensor {
        if !self.training || self.p == 0.0 {
            return x.clone();
        }
        let keep_prob = 1.0 - self.p;
        let shape = x.shape();
        let mut mask_shape = vec![1; shape.len()];
        mask_shape[0] = shape[0];
        let mask: Vec<f32> = with_rng(|rng| {
            (0..shape[0])
                .map(|_| {
                    if rng.random::<f32>() < keep_prob {
                        1.0 / keep_prob
                    } else {
                        0.0
                    }
                })
                .collect()
        });
        x.elem_mul(&RawTensor::new(mask, &mask_shape, false))
    }
}

impl Module for DropPath {
    fn train(&mut self, mode: bool) {
        self.training = mode;
    }
}
