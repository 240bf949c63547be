//! Declarative tower and model configuration.
//!
//! Field names and defaults match the JSON model-config files, so an existing
//! config deserializes unchanged. Unknown fields are rejected.

use crate::error::{ClipError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Vision depth: one transformer depth, or four residual stage depths
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VisionLayers {
    Uniform(usize),
    Stages([usize; 4]),
}

impl Default for VisionLayers {
    fn default() -> Self {
        VisionLayers::Uniform(12)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSize {
    Square(usize),
    Rect([usize; 2]),
}

impl ImageSize {
    /// (height, width)
    pub fn hw(self) -> (usize, usize) {
        match self {
            ImageSize::Square(s) => (s, s),
            ImageSize::Rect([h, w]) => (h, w),
        }
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        ImageSize::Square(224)
    }
}

/// Feature pooling applied to a named vision trunk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrunkPool {
    #[default]
    Avg,
    Max,
    Token,
    AbsAttn,
    RotAttn,
}

/// Output projection of a named backbone
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadProjection {
    #[default]
    Linear,
    Mlp,
    #[serde(rename = "", alias = "none")]
    None,
}

/// Sequence pooling applied to a named text trunk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextPooler {
    #[default]
    MeanPooler,
    MaxPooler,
    ClsPooler,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisionConfig {
    pub layers: VisionLayers,
    pub width: usize,
    pub head_width: usize,
    pub mlp_ratio: f32,
    pub patch_size: usize,
    pub image_size: ImageSize,

    pub ls_init_value: Option<f32>,
    /// Fraction of patch tokens dropped during training
    pub patch_dropout: f32,
    /// Dual patchnorm: layer-norm each flattened patch before embedding it
    pub input_patchnorm: bool,
    pub global_average_pool: bool,
    pub attentional_pool: bool,
    pub n_queries: usize,
    pub attn_pooler_heads: usize,
    pub output_tokens: bool,

    /// A registered trunk name; overrides layers, width and patch_size
    pub timm_model_name: Option<String>,
    pub timm_model_pretrained: bool,
    pub timm_pool: TrunkPool,
    pub timm_proj: HeadProjection,
    pub timm_proj_bias: bool,
    pub timm_drop: f32,
    pub timm_drop_path: Option<f32>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        VisionConfig {
            layers: VisionLayers::default(),
            width: 768,
            head_width: 64,
            mlp_ratio: 4.0,
            patch_size: 16,
            image_size: ImageSize::default(),
            ls_init_value: None,
            patch_dropout: 0.0,
            input_patchnorm: false,
            global_average_pool: false,
            attentional_pool: false,
            n_queries: 256,
            attn_pooler_heads: 8,
            output_tokens: false,
            timm_model_name: None,
            timm_model_pretrained: false,
            timm_pool: TrunkPool::default(),
            timm_proj: HeadProjection::default(),
            timm_proj_bias: false,
            timm_drop: 0.0,
            timm_drop_path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TextConfig {
    pub context_length: usize,
    pub vocab_size: usize,
    pub width: usize,
    pub heads: usize,
    pub layers: usize,
    pub ls_init_value: Option<f32>,
    /// A registered text trunk name; overrides the transformer fields
    pub hf_model_name: Option<String>,
    pub hf_tokenizer_name: Option<String>,
    pub hf_model_pretrained: bool,
    pub proj: HeadProjection,
    pub pooler_type: TextPooler,
    pub embed_cls: bool,
    pub pad_id: usize,
    pub output_tokens: bool,
    pub global_average_pool: bool,
    pub attentional_pool: bool,
    pub n_queries: usize,
    pub attn_pooler_heads: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        TextConfig {
            context_length: 77,
            vocab_size: 49408,
            width: 512,
            heads: 8,
            layers: 12,
            ls_init_value: None,
            hf_model_name: None,
            hf_tokenizer_name: None,
            hf_model_pretrained: false,
            proj: HeadProjection::Mlp,
            pooler_type: TextPooler::default(),
            embed_cls: false,
            pad_id: 0,
            output_tokens: false,
            global_average_pool: false,
            attentional_pool: false,
            n_queries: 256,
            attn_pooler_heads: 8,
        }
    }
}

/// Structured multi-slot representation (SPARO) settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SparoConfig {
    /// Number of slots (L)
    #[serde(alias = "L")]
    pub num_slots: usize,
    /// Values per slot (V)
    #[serde(alias = "V")]
    pub slot_dim: usize,
    pub attn_dim: usize,
    pub value_dim: usize,
    pub heads: usize,
    /// "representation:weighting", e.g. "cont:const"
    pub sparo_type: String,
    pub share_kv: bool,
    pub share_queries: bool,
}

impl Default for SparoConfig {
    fn default() -> Self {
        SparoConfig {
            num_slots: 16,
            slot_dim: 32,
            attn_dim: 64,
            value_dim: 64,
            heads: 1,
            sparo_type: "cont:const".to_string(),
            share_kv: true,
            share_queries: false,
        }
    }
}

/// Discrete codebook (FDT) settings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodebookConfig {
    pub num_codes: usize,
}

impl Default for CodebookConfig {
    fn default() -> Self {
        CodebookConfig { num_codes: 16384 }
    }
}

/// A complete model description, as stored in a JSON model config
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub embed_dim: usize,
    pub vision_cfg: VisionConfig,
    pub text_cfg: TextConfig,
    pub quick_gelu: bool,
    /// Keep the text tower under its own `text.` namespace
    pub custom_text: bool,
    pub output_dict: bool,
    /// Layers removed from each tower before construction
    pub reduce_depth: usize,
    pub bottleneck_dim: Option<usize>,
    pub sparo: Option<SparoConfig>,
    pub codebook: Option<CodebookConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            embed_dim: 512,
            vision_cfg: VisionConfig::default(),
            text_cfg: TextConfig::default(),
            quick_gelu: false,
            custom_text: false,
            output_dict: false,
            reduce_depth: 0,
            bottleneck_dim: None,
            sparo: None,
            codebook: None,
        }
    }
}

impl ModelConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject option combinations no model variant can honor
    pub fn validate(&self) -> Result<()> {
        if self.sparo.is_some() && self.codebook.is_some() {
            return Err(ClipError::Config(
                "structured (SPARO) and codebook modes cannot be used together".into(),
            ));
        }
        if self.custom_text && (self.sparo.is_some() || self.codebook.is_some()) {
            return Err(ClipError::Config(
                "structured and codebook modes require the flattened text layout".into(),
            ));
        }
        if self.embed_dim == 0 {
            return Err(ClipError::Config("embed_dim must be positive".into()));
        }
        Ok(())
    }
}
