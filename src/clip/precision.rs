//! Reduced-precision conversion of assembled models.

use crate::dtype::DType;
use crate::error::{ClipError, Result};
use crate::nn::{LayerKind, Module, walk_modules};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Own tensors cast regardless of the owning module's kind
const PROJECTION_NAMES: [&str; 2] = ["text_projection", "proj"];

/// Training/inference precision setting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    PureFp16,
    PureBf16,
    Amp,
    AmpBf16,
}

impl Precision {
    /// Dtype that projection weights are converted to, if any
    pub fn cast_dtype(self) -> Option<DType> {
        match self {
            Precision::Fp16 => Some(DType::F16),
            Precision::Bf16 => Some(DType::BF16),
            _ => None,
        }
    }

    /// Convert a freshly built model to this precision.
    ///
    /// `fp16`/`bf16` downcast linear, conv, attention and projection weights;
    /// the `pure_*` settings downcast every tensor.
    pub fn apply(self, model: &dyn Module) -> Result<()> {
        match self {
            Precision::Fp16 => convert_weights_to_lp(model, DType::F16),
            Precision::Bf16 => convert_weights_to_lp(model, DType::BF16),
            Precision::PureFp16 => cast_all(model, DType::F16),
            Precision::PureBf16 => cast_all(model, DType::BF16),
            Precision::Fp32 | Precision::Amp | Precision::AmpBf16 => Ok(()),
        }
    }
}

impl FromStr for Precision {
    type Err = ClipError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp32" => Ok(Precision::Fp32),
            "fp16" => Ok(Precision::Fp16),
            "bf16" => Ok(Precision::Bf16),
            "pure_fp16" => Ok(Precision::PureFp16),
            "pure_bf16" => Ok(Precision::PureBf16),
            "amp" => Ok(Precision::Amp),
            "amp_bf16" => Ok(Precision::AmpBf16),
            other => Err(ClipError::Config(format!("unknown precision '{other}'"))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Bf16 => "bf16",
            Precision::PureFp16 => "pure_fp16",
            Precision::PureBf16 => "pure_bf16",
            Precision::Amp => "amp",
            Precision::AmpBf16 => "amp_bf16",
        };
        f.write_str(name)
    }
}

fn ensure_reduced(dtype: DType) -> Result<()> {
    if dtype.is_reduced_float() {
        Ok(())
    } else {
        Err(ClipError::InvalidParameter(format!(
            "{dtype} is not a reduced-precision float type"
        )))
    }
}

/// Downcast the weights of recognised layers in place.
///
/// Linear and conv layers convert weight and bias; attention layers convert
/// their input projections, biases and `bias_k`/`bias_v`; any module's own
/// `text_projection` or `proj` tensor converts too. Everything else,
/// normalization layers included, keeps its dtype. `requires_grad` is kept.
pub fn convert_weights_to_lp(model: &dyn Module, dtype: DType) -> Result<()> {
    ensure_reduced(dtype)?;
    walk_modules(model, &mut |m| {
        let kind = m.layer_kind();
        let whole = matches!(kind, LayerKind::Linear | LayerKind::Conv | LayerKind::Attention);
        m.own_tensors(&mut |name, t, _| {
            if whole || PROJECTION_NAMES.contains(&name) {
                t.borrow_mut().cast_(dtype);
            }
        });
    });
    Ok(())
}

/// Cast every float tensor, parameters and buffers alike
pub fn cast_all(model: &dyn Module, dtype: DType) -> Result<()> {
    ensure_reduced(dtype)?;
    model.visit_tensors("", &mut |_, t, _| {
        let mut raw = t.borrow_mut();
        if raw.dtype.is_float() {
            raw.cast_(dtype);
        }
    });
    Ok(())
}
