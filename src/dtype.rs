//! Storage precision tags for tensors
//!
//! Tensor values always live in an `f32` buffer. The dtype tag records the
//! precision the values are stored at: tagging a tensor F16 or BF16 rounds
//! every value through `half`, so the buffer only ever holds values that are
//! exactly representable in the tagged type.

use bincode::{Decode, Encode};
use half::{bf16, f16};
use std::fmt;

/// Supported tensor data types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Encode, Decode)]
#[repr(u8)]
pub enum DType {
    /// 16-bit floating point (IEEE 754 half precision)
    F16 = 0,
    /// 16-bit brain floating point (truncated f32 mantissa)
    BF16 = 1,
    /// 32-bit floating point (default)
    #[default]
    F32 = 2,
    /// 64-bit floating point (values are still held as f32)
    F64 = 3,
    /// 32-bit signed integer
    I32 = 4,
    /// 64-bit signed integer
    I64 = 5,
    /// 8-bit unsigned integer
    U8 = 6,
    /// Boolean (stored as 0.0 / 1.0)
    Bool = 7,
}

impl DType {
    /// Returns the name of this dtype as a string
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }

    /// Returns true if this is a floating-point type
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Returns true for the 16-bit float types
    #[must_use]
    pub fn is_reduced_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Round a single value to the nearest value representable in this dtype.
    #[must_use]
    pub fn round(&self, v: f32) -> f32 {
        match self {
            DType::F16 => f16::from_f32(v).to_f32(),
            DType::BF16 => bf16::from_f32(v).to_f32(),
            DType::F32 | DType::F64 => v,
            DType::I32 | DType::I64 | DType::U8 => v.round(),
            DType::Bool => {
                if v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Round a buffer in place. No-op for f32/f64.
    pub fn round_slice(&self, data: &mut [f32]) {
        if matches!(self, DType::F32 | DType::F64) {
            return;
        }
        for v in data.iter_mut() {
            *v = self.round(*v);
        }
    }

    /// Determines the result dtype when two dtypes are combined in an operation.
    /// Follows type promotion rules similar to PyTorch/NumPy.
    #[must_use]
    pub fn promote(a: DType, b: DType) -> DType {
        use DType::*;

        if a == b {
            return a;
        }

        match (a, b) {
            (F64, _) | (_, F64) => F64,

            (F32, F16 | BF16 | I32 | I64 | U8 | Bool)
            | (F16 | BF16 | I32 | I64 | U8 | Bool, F32) => F32,

            // Mixed half types widen to F32
            (F16, BF16) | (BF16, F16) => F32,

            // A float paired with an integer keeps the float type
            (F16, I32 | I64 | U8 | Bool) | (I32 | I64 | U8 | Bool, F16) => F16,
            (BF16, I32 | I64 | U8 | Bool) | (I32 | I64 | U8 | Bool, BF16) => BF16,

            (I64, I32 | U8 | Bool) | (I32 | U8 | Bool, I64) => I64,
            (I32, U8 | Bool) | (U8 | Bool, I32) => I32,
            (U8, Bool) | (Bool, U8) => U8,

            _ => F32,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_promote() {
        assert_eq!(DType::promote(DType::F32, DType::F32), DType::F32);
        assert_eq!(DType::promote(DType::F16, DType::F32), DType::F32);
        assert_eq!(DType::promote(DType::F16, DType::BF16), DType::F32);
        assert_eq!(DType::promote(DType::F16, DType::F16), DType::F16);
        assert_eq!(DType::promote(DType::I64, DType::BF16), DType::BF16);
        assert_eq!(DType::promote(DType::I32, DType::I64), DType::I64);
    }

    #[test]
    fn test_reduced_float() {
        assert!(DType::F16.is_reduced_float());
        assert!(DType::BF16.is_reduced_float());
        assert!(!DType::F32.is_reduced_float());
        assert!(!DType::I64.is_reduced_float());
    }

    #[test]
    fn test_round_is_idempotent() {
        let values = [0.1_f32, 1.0 / 3.0, 65504.0, -2.5e-4, 1234.5678];
        for dtype in [DType::F16, DType::BF16] {
            for &v in &values {
                let once = dtype.round(v);
                assert_eq!(once.to_bits(), dtype.round(once).to_bits());
            }
        }
        assert_eq!(DType::F32.round(0.1), 0.1);
        assert_eq!(DType::I64.round(2.6), 3.0);
    }
}
