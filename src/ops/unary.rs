use crate::{RawTensor, Tensor};

/// Unary operations: single input, single output
///
/// - Neg: -x
/// - Sqrt: √x
/// - Exp: eˣ
/// - Tanh: tanh(x)
/// - Sigmoid: σ(x) = 1/(1+e⁻ˣ)
/// - `ReLU`: max(0, x)
/// - Gelu: x·Φ(x), the exact (erf) form
/// - `QuickGelu`: x·σ(1.702x)
#[derive(Clone, Copy, Debug)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Exp,
    Tanh,
    Sigmoid,
    ReLU,
    Gelu,
    QuickGelu,
}

/// Error function, Abramowitz & Stegun 7.1.26 (|err| < 1.5e-7)
pub fn erf(x: f32) -> f32 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let x = f64::from(x);
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    (sign * y) as f32
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl UnaryOp {
    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => sigmoid(x),
            UnaryOp::ReLU => x.max(0.0),
            UnaryOp::Gelu => 0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2)),
            UnaryOp::QuickGelu => x * sigmoid(1.702 * x),
        }
    }
}

impl RawTensor {
    /// Apply a unary operation element-wise
    ///
    /// The result keeps the input dtype and is rounded into it.
    pub fn unary_op(t: &Tensor, op: UnaryOp) -> Tensor {
        let s = t.borrow();
        let result: Vec<f32> = s.data.iter().map(|&x| op.apply(x)).collect();
        Self::from_raw(result, &s.shape, s.dtype)
    }

    // Convenience methods for each unary operation
    pub fn neg(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Neg)
    }
    pub fn sqrt(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Sqrt)
    }
    pub fn exp(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Exp)
    }
    pub fn tanh(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Tanh)
    }
    pub fn sigmoid(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Sigmoid)
    }
    pub fn relu(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::ReLU)
    }
    pub fn gelu(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Gelu)
    }
    pub fn quick_gelu(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::QuickGelu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorOps;

    #[test]
    fn test_erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-6);
        assert!((erf(0.5) - 0.520_499_9).abs() < 1e-6);
        assert!((erf(1.0) - 0.842_700_8).abs() < 1e-6);
        assert!((erf(-1.0) + 0.842_700_8).abs() < 1e-6);
        assert!((erf(3.0) - 0.999_977_9).abs() < 1e-6);
    }

    #[test]
    fn test_gelu_variants_differ() {
        let x = RawTensor::new(vec![-1.0, 0.0, 1.0], &[3], false);
        let exact = x.gelu().to_vec();
        let quick = x.quick_gelu().to_vec();
        assert!((exact[2] - 0.841_344_7).abs() < 1e-5);
        assert!((quick[2] - 0.845_722_8).abs() < 1e-5);
        assert_eq!(exact[1], 0.0);
        assert_ne!(exact[0], quick[0]);
    }

    #[test]
    fn test_relu_sigmoid() {
        let x = RawTensor::new(vec![-2.0, 0.0, 2.0], &[3], false);
        assert_eq!(x.relu().to_vec(), vec![0.0, 0.0, 2.0]);
        assert!((x.sigmoid().to_vec()[1] - 0.5).abs() < 1e-7);
    }
}
