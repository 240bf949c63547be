//! Tower selection.
//!
//! [`build_vision_tower`] and [`build_text_tower`] map a config plus mode
//! options onto one concrete tower. The first matching rule wins: a named
//! backbone, then (vision only) a residual network for four stage depths,
//! then a plain or structured transformer.

use crate::clip::backbone::{BackboneRegistry, NamedTextTower, NamedVisionTower};
use crate::clip::config::{TextConfig, VisionConfig, VisionLayers};
use crate::clip::resnet::ModifiedResNet;
use crate::clip::sparo::{SparoHeadConfig, SparoTextTransformer, SparoVisionTransformer};
use crate::clip::text::TextTransformer;
use crate::clip::transformer::BlockOptions;
use crate::clip::vision::{VisionHead, VisionTransformer};
use crate::dtype::DType;
use crate::error::{ClipError, Result, exact_div};
use crate::nn::{Activation, Module, NormPrecision, TensorKind};
use crate::tensor::Tensor;
use tracing::debug;

/// Which representation a tower feeds into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TowerMode {
    /// Pooled, projected embedding
    Standard,
    /// Slot head emitting `L·V` values
    Sparo(SparoHeadConfig),
    /// Unpooled tokens for a codebook query model
    Codebook,
}

impl TowerMode {
    fn name(&self) -> &'static str {
        match self {
            TowerMode::Standard => "standard mode",
            TowerMode::Sparo(_) => "structured (SPARO) mode",
            TowerMode::Codebook => "codebook mode",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TowerOptions {
    pub quick_gelu: bool,
    /// Compute dtype requested for the finished model, if reduced
    pub cast_dtype: Option<DType>,
    /// Layers removed before construction
    pub reduce_depth: usize,
    pub mode: TowerMode,
}

impl Default for TowerOptions {
    fn default() -> Self {
        TowerOptions {
            quick_gelu: false,
            cast_dtype: None,
            reduce_depth: 0,
            mode: TowerMode::Standard,
        }
    }
}

impl TowerOptions {
    /// Normalization runs in f32 whenever the model computes in f16/bf16
    pub fn norm_precision(&self) -> NormPrecision {
        match self.cast_dtype {
            Some(d) if d.is_reduced_float() => NormPrecision::Fp32,
            _ => NormPrecision::Native,
        }
    }

    fn activation(&self) -> Activation {
        Activation::from_quick_gelu(self.quick_gelu)
    }

    fn depth(&self, layers: usize) -> Result<usize> {
        layers.checked_sub(self.reduce_depth).ok_or_else(|| {
            ClipError::Config(format!(
                "cannot remove {} layers from a {layers}-layer tower",
                self.reduce_depth
            ))
        })
    }
}

/// Tower features, plus slot attention weights in structured mode
#[derive(Clone, Debug)]
pub struct TowerOutput {
    pub features: Tensor,
    pub attn: Option<Tensor>,
}

impl TowerOutput {
    fn plain(features: Tensor) -> Self {
        TowerOutput {
            features,
            attn: None,
        }
    }
}

pub enum VisionTower {
    Transformer(VisionTransformer),
    Sparo(SparoVisionTransformer),
    ResNet(ModifiedResNet),
    Named(NamedVisionTower),
}

impl VisionTower {
    fn module(&self) -> &dyn Module {
        match self {
            VisionTower::Transformer(m) => m,
            VisionTower::Sparo(m) => m,
            VisionTower::ResNet(m) => m,
            VisionTower::Named(m) => m,
        }
    }

    fn module_mut(&mut self) -> &mut dyn Module {
        match self {
            VisionTower::Transformer(m) => m,
            VisionTower::Sparo(m) => m,
            VisionTower::ResNet(m) => m,
            VisionTower::Named(m) => m,
        }
    }

    /// `[B, 3, H, W]` → pooled features, or tokens for a token-mode tower
    pub fn forward(&self, image: &Tensor) -> TowerOutput {
        match self {
            VisionTower::Transformer(m) => TowerOutput::plain(m.forward(image)),
            VisionTower::Sparo(m) => {
                let (features, attn) = m.forward(image);
                TowerOutput {
                    features,
                    attn: Some(attn),
                }
            }
            VisionTower::ResNet(m) => TowerOutput::plain(m.forward(image)),
            VisionTower::Named(m) => TowerOutput::plain(m.forward(image)),
        }
    }

    /// Token width of transformer-family towers
    pub fn width(&self) -> Option<usize> {
        match self {
            VisionTower::Transformer(m) => Some(m.width),
            VisionTower::Sparo(m) => Some(m.trunk.width),
            VisionTower::ResNet(_) | VisionTower::Named(_) => None,
        }
    }

    /// Patch grid of towers with a `positional_embedding` table
    pub fn grid_size(&self) -> Option<(usize, usize)> {
        match self {
            VisionTower::Transformer(m) => Some(m.grid_size),
            VisionTower::Sparo(m) => Some(m.trunk.grid_size),
            VisionTower::ResNet(_) | VisionTower::Named(_) => None,
        }
    }

    pub fn lock(&mut self, unlocked_groups: usize, freeze_bn_stats: bool) -> Result<()> {
        match self {
            VisionTower::Transformer(m) => {
                m.lock(unlocked_groups);
                Ok(())
            }
            VisionTower::Sparo(m) => {
                m.lock(unlocked_groups);
                Ok(())
            }
            VisionTower::ResNet(m) => m.lock(unlocked_groups, freeze_bn_stats),
            VisionTower::Named(m) => m.lock(unlocked_groups, freeze_bn_stats),
        }
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        match self {
            VisionTower::Transformer(m) => m.set_grad_checkpointing(enable),
            VisionTower::Sparo(m) => m.trunk.set_grad_checkpointing(enable),
            VisionTower::ResNet(m) => m.set_grad_checkpointing(enable),
            VisionTower::Named(m) => m.set_grad_checkpointing(enable),
        }
    }
}

impl Module for VisionTower {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        self.module().own_tensors(f);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        self.module().for_each_child(f);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        self.module_mut().for_each_child_mut(f);
    }

    fn train(&mut self, mode: bool) {
        self.module_mut().train(mode);
    }
}

pub enum TextTower {
    Transformer(TextTransformer),
    Sparo(SparoTextTransformer),
    Named(NamedTextTower),
}

impl TextTower {
    fn module(&self) -> &dyn Module {
        match self {
            TextTower::Transformer(m) => m,
            TextTower::Sparo(m) => m,
            TextTower::Named(m) => m,
        }
    }

    fn module_mut(&mut self) -> &mut dyn Module {
        match self {
            TextTower::Transformer(m) => m,
            TextTower::Sparo(m) => m,
            TextTower::Named(m) => m,
        }
    }

    /// Token ids `[B, L]` → pooled features
    pub fn forward(&self, text: &Tensor) -> TowerOutput {
        match self {
            TextTower::Transformer(m) => TowerOutput::plain(m.forward(text)),
            TextTower::Sparo(m) => {
                let (features, attn) = m.forward(text);
                TowerOutput {
                    features,
                    attn: Some(attn),
                }
            }
            TextTower::Named(m) => TowerOutput::plain(m.forward(text)),
        }
    }

    pub fn width(&self) -> Option<usize> {
        match self {
            TextTower::Transformer(m) => Some(m.width),
            TextTower::Sparo(m) => Some(m.trunk.width),
            TextTower::Named(_) => None,
        }
    }

    pub fn lock(&mut self, unlocked_layers: usize, freeze_layer_norm: bool) {
        match self {
            TextTower::Transformer(m) => m.lock(unlocked_layers, freeze_layer_norm),
            TextTower::Sparo(m) => m.lock(unlocked_layers, freeze_layer_norm),
            TextTower::Named(m) => m.lock(unlocked_layers, freeze_layer_norm),
        }
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        match self {
            TextTower::Transformer(m) => m.set_grad_checkpointing(enable),
            TextTower::Sparo(m) => m.trunk.set_grad_checkpointing(enable),
            TextTower::Named(m) => m.set_grad_checkpointing(enable),
        }
    }
}

impl Module for TextTower {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        self.module().own_tensors(f);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        self.module().for_each_child(f);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        self.module_mut().for_each_child_mut(f);
    }

    fn train(&mut self, mode: bool) {
        self.module_mut().train(mode);
    }
}

fn incompatible(backbone: &str, mode: TowerMode) -> ClipError {
    ClipError::IncompatibleMode {
        backbone: backbone.to_string(),
        mode: mode.name().to_string(),
    }
}

/// Build the image tower emitting `embed_dim` features
pub fn build_vision_tower(
    embed_dim: usize,
    cfg: &VisionConfig,
    opts: &TowerOptions,
    registry: &BackboneRegistry,
) -> Result<VisionTower> {
    let norm = opts.norm_precision();

    if let Some(name) = &cfg.timm_model_name {
        debug!(backbone = %name, "building named vision tower");
        if opts.mode != TowerMode::Standard {
            return Err(incompatible(name, opts.mode));
        }
        return Ok(VisionTower::Named(NamedVisionTower::new(
            cfg, embed_dim, registry, norm,
        )?));
    }

    match cfg.layers {
        VisionLayers::Stages(mut layers) => {
            debug!(?layers, "building residual vision tower");
            if opts.mode != TowerMode::Standard {
                return Err(incompatible("modified resnet", opts.mode));
            }
            layers[2] = opts.depth(layers[2])?;
            let (h, w) = cfg.image_size.hw();
            if h != w {
                return Err(ClipError::Config(format!(
                    "residual tower needs a square image, got {h}x{w}"
                )));
            }
            exact_div("image size / 32", h, 32)?;
            let heads = exact_div("residual width * 32 / head width", cfg.width * 32, cfg.head_width)?;
            Ok(VisionTower::ResNet(ModifiedResNet::new(
                layers, embed_dim, heads, h, cfg.width,
            )))
        }
        VisionLayers::Uniform(layers) => {
            let depth = opts.depth(layers)?;
            let heads = exact_div("vision width / head width", cfg.width, cfg.head_width)?;
            let block = BlockOptions {
                mlp_ratio: cfg.mlp_ratio,
                ls_init_value: cfg.ls_init_value,
                act: opts.activation(),
                norm,
                ..BlockOptions::default()
            };
            debug!(depth, heads, width = cfg.width, mode = opts.mode.name(), "building vision transformer");
            match opts.mode {
                TowerMode::Standard => Ok(VisionTower::Transformer(VisionTransformer::new(
                    cfg,
                    depth,
                    heads,
                    embed_dim,
                    &block,
                    VisionHead::Pooled,
                )?)),
                TowerMode::Codebook => Ok(VisionTower::Transformer(VisionTransformer::new(
                    cfg,
                    depth,
                    heads,
                    embed_dim,
                    &block,
                    VisionHead::Tokens,
                )?)),
                TowerMode::Sparo(head) => Ok(VisionTower::Sparo(SparoVisionTransformer::new(
                    cfg, depth, heads, &block, head,
                )?)),
            }
        }
    }
}

/// Build the text tower emitting `embed_dim` features
pub fn build_text_tower(
    embed_dim: usize,
    cfg: &TextConfig,
    opts: &TowerOptions,
    registry: &BackboneRegistry,
) -> Result<TextTower> {
    let norm = opts.norm_precision();

    if let Some(name) = &cfg.hf_model_name {
        debug!(backbone = %name, "building named text tower");
        if opts.mode != TowerMode::Standard {
            return Err(incompatible(name, opts.mode));
        }
        return Ok(TextTower::Named(NamedTextTower::new(
            cfg, embed_dim, registry, norm,
        )?));
    }

    let depth = opts.depth(cfg.layers)?;
    exact_div("text width / heads", cfg.width, cfg.heads)?;
    let block = BlockOptions {
        ls_init_value: cfg.ls_init_value,
        act: opts.activation(),
        norm,
        ..BlockOptions::default()
    };
    debug!(depth, heads = cfg.heads, width = cfg.width, mode = opts.mode.name(), "building text transformer");
    match opts.mode {
        TowerMode::Standard => Ok(TextTower::Transformer(TextTransformer::new(
            cfg,
            depth,
            Some(embed_dim),
            &block,
        ))),
        TowerMode::Codebook => Ok(TextTower::Transformer(TextTransformer::new(
            cfg, depth, None, &block,
        ))),
        TowerMode::Sparo(head) => Ok(TextTower::Sparo(SparoTextTransformer::new(
            cfg, depth, &block, head,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::config::ImageSize;
    use crate::tensor::{RawTensor, TensorOps};

    fn small_vit() -> VisionConfig {
        VisionConfig {
            layers: VisionLayers::Uniform(2),
            width: 16,
            head_width: 8,
            patch_size: 4,
            image_size: ImageSize::Square(8),
            ..VisionConfig::default()
        }
    }

    fn small_text() -> TextConfig {
        TextConfig {
            context_length: 5,
            vocab_size: 12,
            width: 8,
            heads: 2,
            layers: 2,
            ..TextConfig::default()
        }
    }

    fn sparo_head() -> SparoHeadConfig {
        SparoHeadConfig {
            num_slots: 2,
            slot_dim: 3,
            attn_dim: 4,
            value_dim: 4,
            heads: 1,
            share_kv: true,
        }
    }

    #[test]
    fn test_transformer_path_and_heads() {
        let tower = build_vision_tower(6, &small_vit(), &TowerOptions::default(), &BackboneRegistry::default())
            .unwrap();
        let VisionTower::Transformer(vit) = &tower else {
            panic!("expected a vision transformer");
        };
        assert_eq!(vit.transformer.resblocks[0].attn.num_heads, 2);
        assert_eq!(tower.grid_size(), Some((2, 2)));
        let out = tower.forward(&RawTensor::randn(&[1, 3, 8, 8]));
        assert_eq!(out.features.shape(), vec![1, 6]);
        assert!(out.attn.is_none());
    }

    #[test]
    fn test_non_exact_head_width_fails() {
        let cfg = VisionConfig {
            head_width: 5,
            ..small_vit()
        };
        let err = build_vision_tower(6, &cfg, &TowerOptions::default(), &BackboneRegistry::default());
        assert!(matches!(err, Err(ClipError::NonExactRatio { .. })));
    }

    #[test]
    fn test_residual_path_rejects_sparo() {
        let cfg = VisionConfig {
            layers: VisionLayers::Stages([1, 1, 1, 1]),
            width: 8,
            head_width: 64,
            image_size: ImageSize::Square(64),
            ..VisionConfig::default()
        };
        let registry = BackboneRegistry::default();
        let tower = build_vision_tower(4, &cfg, &TowerOptions::default(), &registry).unwrap();
        assert!(matches!(tower, VisionTower::ResNet(_)));

        let opts = TowerOptions {
            mode: TowerMode::Sparo(sparo_head()),
            ..TowerOptions::default()
        };
        let err = build_vision_tower(4, &cfg, &opts, &registry);
        assert!(matches!(err, Err(ClipError::IncompatibleMode { .. })));
    }

    #[test]
    fn test_depth_reduction() {
        let opts = TowerOptions {
            reduce_depth: 1,
            ..TowerOptions::default()
        };
        let registry = BackboneRegistry::default();
        let TextTower::Transformer(text) = build_text_tower(4, &small_text(), &opts, &registry).unwrap() else {
            panic!("expected a text transformer");
        };
        assert_eq!(text.transformer.layers(), 1);

        let opts = TowerOptions {
            reduce_depth: 3,
            ..TowerOptions::default()
        };
        let err = build_text_tower(4, &small_text(), &opts, &registry);
        assert!(matches!(err, Err(ClipError::Config(_))));
    }

    #[test]
    fn test_reduced_precision_selects_fp32_norm() {
        let opts = TowerOptions {
            cast_dtype: Some(DType::BF16),
            quick_gelu: true,
            ..TowerOptions::default()
        };
        assert_eq!(opts.norm_precision(), NormPrecision::Fp32);
        let registry = BackboneRegistry::default();
        let TextTower::Transformer(text) = build_text_tower(4, &small_text(), &opts, &registry).unwrap() else {
            panic!("expected a text transformer");
        };
        assert_eq!(text.ln_final.precision, NormPrecision::Fp32);
        assert_eq!(text.transformer.resblocks[0].mlp.act, Activation::QuickGelu);
    }

    #[test]
    fn test_sparo_towers_emit_attention() {
        let opts = TowerOptions {
            mode: TowerMode::Sparo(sparo_head()),
            ..TowerOptions::default()
        };
        let registry = BackboneRegistry::default();
        let vision = build_vision_tower(6, &small_vit(), &opts, &registry).unwrap();
        let out = vision.forward(&RawTensor::randn(&[2, 3, 8, 8]));
        assert_eq!(out.features.shape(), vec![2, 6]);
        assert_eq!(out.attn.unwrap().shape(), vec![2, 2, 1, 5]);

        let text = build_text_tower(6, &small_text(), &opts, &registry).unwrap();
        let ids = RawTensor::new(vec![1.0, 11.0, 0.0, 0.0, 0.0], &[1, 5], false);
        assert_eq!(text.forward(&ids).features.shape(), vec![1, 6]);
    }

    #[test]
    fn test_named_backbone_rejects_modes() {
        let cfg = VisionConfig {
            timm_model_name: Some("vit_tiny_patch16_224".into()),
            ..VisionConfig::default()
        };
        let opts = TowerOptions {
            mode: TowerMode::Codebook,
            ..TowerOptions::default()
        };
        let err = build_vision_tower(8, &cfg, &opts, &BackboneRegistry::default());
        assert!(matches!(err, Err(ClipError::IncompatibleMode { .. })));
    }
}
