use crate::tensor::{Tensor, TensorOps};

/// Point-wise activation selected at construction time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Activation {
    /// x·Φ(x) using erf
    #[default]
    Gelu,
    /// x·σ(1.702x), the sigmoid approximation used by early checkpoints
    QuickGelu,
    ReLU,
}

impl Activation {
    pub fn from_quick_gelu(quick_gelu: bool) -> Self {
        if quick_gelu {
            Activation::QuickGelu
        } else {
            Activation::Gelu
        }
    }

    pub fn forward(self, x: &Tensor) -> Tensor {
        match self {
            Activation::Gelu => x.gelu(),
            Activation::QuickGelu => x.quick_gelu(),
            Activation::ReLU => x.relu(),
        }
    }
}
